//! Per-cell readers/writer lock.
//!
//! Readers share a Full cell; exclusive operations (`read_fe`, the write
//! family, `faa`, `cas`, `set_tag`) wait until every reader has released.
//! A waiting exclusive requester blocks new readers from joining, so writers
//! are not starved by a steady stream of readers.

use tagshm_primitives::Gate;

use crate::error::{Error, Result};
use crate::region::Region;
use crate::wait::wait_for;

impl Region {
    /// Take a shared hold on a Full cell and return its value.
    ///
    /// The hold lasts until [`release_rw`](Self::release_rw).
    pub fn read_rw(&self, index: usize) -> Result<crate::Value> {
        let slot = self.slot(index)?;
        let prior = wait_for("read_rw", Some(index), self.timeout(), || {
            slot.try_lock_shared(Gate::Full).ok()
        })?;
        match self.decode(index, prior.kind(), slot.value()) {
            Ok(value) => Ok(value),
            Err(e) => {
                let _ = slot.release_shared();
                Err(e)
            }
        }
    }

    /// Drop one shared hold taken by [`read_rw`](Self::read_rw).
    pub fn release_rw(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        slot.release_shared()
            .map(|_| ())
            .map_err(|_| Error::NotLocked { index })
    }
}

#[cfg(test)]
mod tests {
    use crate::cell::Tag;
    use crate::config::RegionConfig;
    use crate::error::Error;
    use crate::region::Region;
    use crate::value::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn region(label: &str) -> Region {
        let path = std::env::temp_dir().join(format!("test_rw_{}_{}.shm", label, std::process::id()));
        Region::create(
            &path,
            RegionConfig {
                cells: 2,
                fill: Some(Value::Int(7)),
                persist: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_many_readers_share() {
        let r = region("share");
        for _ in 0..16 {
            assert_eq!(r.read_rw(0).unwrap(), Value::Int(7));
        }
        for _ in 0..16 {
            r.release_rw(0).unwrap();
        }
        assert!(matches!(r.release_rw(0), Err(Error::NotLocked { index: 0 })));
    }

    #[test]
    fn test_readers_block_writers() {
        let r = region("block");
        r.read_rw(0).unwrap();
        r.set_timeout(Some(Duration::from_millis(20)));
        assert!(r.write(0, 1i64).unwrap_err().is_timeout());
        // The waiting writer keeps new readers out until the count drains.
        assert!(r.read_rw(0).unwrap_err().is_timeout());
        r.release_rw(0).unwrap();
        r.write(0, 1i64).unwrap();
        assert_eq!(r.read_rw(0).unwrap(), Value::Int(1));
        r.release_rw(0).unwrap();
    }

    #[test]
    fn test_holder_can_peek_past_queued_writer() {
        let r = Arc::new(region("peek"));
        r.read_rw(0).unwrap();
        let writer = {
            let r = r.clone();
            std::thread::spawn(move || r.write(0, 6i64))
        };
        while !r.slot(0).unwrap().tag().writer_waiting() {
            std::thread::yield_now();
        }
        r.set_timeout(Some(Duration::from_millis(200)));
        assert_eq!(r.read(0).unwrap(), Value::Int(7));
        r.release_rw(0).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(r.read(0).unwrap(), Value::Int(6));
    }

    #[test]
    fn test_empty_cell_excludes_readers() {
        let r = region("empty");
        r.set_tag(1, Tag::Empty).unwrap();
        r.set_timeout(Some(Duration::from_millis(20)));
        assert!(r.read_rw(1).unwrap_err().is_timeout());
    }

    #[test]
    fn test_writer_proceeds_after_release() {
        let r = Arc::new(region("handoff"));
        r.read_rw(0).unwrap();
        let wrote = Arc::new(AtomicBool::new(false));
        let writer = {
            let r = r.clone();
            let wrote = wrote.clone();
            std::thread::spawn(move || {
                r.write(0, 2i64).unwrap();
                wrote.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!wrote.load(Ordering::SeqCst));
        r.release_rw(0).unwrap();
        writer.join().unwrap();
        assert_eq!(r.read(0).unwrap(), Value::Int(2));
    }
}
