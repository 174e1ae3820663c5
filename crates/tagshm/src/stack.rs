//! LIFO stack and FIFO queue over the region's cells.
//!
//! Cursors live in the region header. A cursor move is a single atomic
//! read-modify-write that checks the bound and advances in one step; the
//! claimed cell is then handed over with `write_ef` / `read_fe`, so a consumer
//! that claims a cell before its producer has filled it simply waits for Full.
//!
//! Cells used this way must start Empty. A region serves as either a stack or a
//! queue, not both.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::region::Region;
use crate::value::Value;

impl Region {
    /// Push onto the stack. Fails with [`Error::StackFull`] when every cell is in use.
    ///
    /// The value is staged in the heap before a slot is claimed, so a payload
    /// that does not fit never leaves a claimed slot behind.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let capacity = self.len() as u64;
        let staged = self.stage(&value.into())?;
        let claimed = self
            .header()
            .stack_top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                (top < capacity).then_some(top + 1)
            });
        let Ok(top) = claimed else {
            self.discard(staged);
            return Err(Error::StackFull {
                capacity: self.len(),
            });
        };
        tracing::trace!(slot = top, "push");
        self.write_ef_staged("push", top as usize, staged)
    }

    /// Pop from the stack; `None` when it is empty.
    pub fn pop(&self) -> Result<Option<Value>> {
        match self
            .header()
            .stack_top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| top.checked_sub(1))
        {
            Ok(top) => {
                tracing::trace!(slot = top - 1, "pop");
                self.read_fe((top - 1) as usize).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    /// Append to the queue. Fails with [`Error::QueueFull`] when every cell holds
    /// an undelivered item.
    pub fn enqueue(&self, value: impl Into<Value>) -> Result<()> {
        let capacity = self.len() as u64;
        let header = self.header();
        let staged = self.stage(&value.into())?;
        let claimed = header
            .queue_tail
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tail| {
                let head = header.queue_head.load(Ordering::Acquire);
                (tail.saturating_sub(head) < capacity).then_some(tail + 1)
            });
        let Ok(ticket) = claimed else {
            self.discard(staged);
            return Err(Error::QueueFull {
                capacity: self.len(),
            });
        };
        tracing::trace!(ticket, "enqueue");
        self.write_ef_staged("enqueue", (ticket % capacity) as usize, staged)
    }

    /// Take the oldest queued item; `None` when the queue is empty.
    pub fn dequeue(&self) -> Result<Option<Value>> {
        let capacity = self.len() as u64;
        let header = self.header();
        match header
            .queue_head
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |head| {
                (head < header.queue_tail.load(Ordering::Acquire)).then_some(head + 1)
            }) {
            Ok(ticket) => {
                tracing::trace!(ticket, "dequeue");
                self.read_fe((ticket % capacity) as usize).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    /// Items currently on the stack (claimed pushes included).
    pub fn stack_len(&self) -> usize {
        self.header().stack_top.load(Ordering::Acquire) as usize
    }

    /// Items currently queued (claimed enqueues included).
    pub fn queue_len(&self) -> usize {
        let header = self.header();
        let head = header.queue_head.load(Ordering::Acquire);
        let tail = header.queue_tail.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Tag;
    use crate::config::RegionConfig;

    fn region(label: &str, cells: usize) -> Region {
        let path = std::env::temp_dir().join(format!("test_stack_{}_{}.shm", label, std::process::id()));
        Region::create(
            &path,
            RegionConfig {
                cells,
                initial_tag: Tag::Empty,
                persist: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_stack_is_lifo() {
        let r = region("lifo", 4);
        r.push(1i64).unwrap();
        r.push("two").unwrap();
        r.push(3.0f64).unwrap();
        assert_eq!(r.stack_len(), 3);
        assert_eq!(r.pop().unwrap(), Some(Value::Float(3.0)));
        assert_eq!(r.pop().unwrap(), Some(Value::from("two")));
        assert_eq!(r.pop().unwrap(), Some(Value::Int(1)));
        assert_eq!(r.pop().unwrap(), None);
        assert_eq!(r.stack_len(), 0);
    }

    #[test]
    fn test_stack_overflow() {
        let r = region("overflow", 2);
        r.push(1i64).unwrap();
        r.push(2i64).unwrap();
        assert!(matches!(r.push(3i64), Err(Error::StackFull { capacity: 2 })));
        assert_eq!(r.pop().unwrap(), Some(Value::Int(2)));
        r.push(3i64).unwrap();
    }

    #[test]
    fn test_queue_is_fifo_and_wraps() {
        let r = region("fifo", 3);
        for round in 0..4i64 {
            r.enqueue(round * 10).unwrap();
            r.enqueue(round * 10 + 1).unwrap();
            assert_eq!(r.queue_len(), 2);
            assert_eq!(r.dequeue().unwrap(), Some(Value::Int(round * 10)));
            assert_eq!(r.dequeue().unwrap(), Some(Value::Int(round * 10 + 1)));
        }
        assert_eq!(r.dequeue().unwrap(), None);
    }

    fn small_heap_region(label: &str) -> Region {
        let path = std::env::temp_dir().join(format!("test_stack_{}_{}.shm", label, std::process::id()));
        Region::create(
            &path,
            RegionConfig {
                cells: 4,
                heap_size: 64,
                initial_tag: Tag::Empty,
                persist: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_oversized_push_claims_nothing() {
        let r = small_heap_region("push_big");
        let used = r.heap_used();
        assert!(matches!(r.push("x".repeat(4096)), Err(Error::Heap(_))));
        assert_eq!(r.stack_len(), 0);
        assert_eq!(r.pop().unwrap(), None);
        assert_eq!(r.heap_used(), used);

        r.push(5i64).unwrap();
        assert_eq!(r.pop().unwrap(), Some(Value::Int(5)));
    }

    #[test]
    fn test_oversized_enqueue_claims_nothing() {
        let r = small_heap_region("enqueue_big");
        assert!(matches!(r.enqueue(vec![0u8; 4096]), Err(Error::Heap(_))));
        assert_eq!(r.queue_len(), 0);
        assert_eq!(r.dequeue().unwrap(), None);

        r.enqueue(6i64).unwrap();
        assert_eq!(r.dequeue().unwrap(), Some(Value::Int(6)));
    }

    #[test]
    fn test_full_stack_releases_staged_payload() {
        let r = region("full_payload", 1);
        r.push(1i64).unwrap();
        let used = r.heap_used();
        assert!(matches!(r.push("spill"), Err(Error::StackFull { capacity: 1 })));
        assert_eq!(r.heap_used(), used);
    }

    #[test]
    fn test_queue_overflow() {
        let r = region("qfull", 2);
        r.enqueue(1i64).unwrap();
        r.enqueue(2i64).unwrap();
        assert!(matches!(r.enqueue(3i64), Err(Error::QueueFull { capacity: 2 })));
        assert_eq!(r.dequeue().unwrap(), Some(Value::Int(1)));
        r.enqueue(3i64).unwrap();
        assert_eq!(r.dequeue().unwrap(), Some(Value::Int(2)));
        assert_eq!(r.dequeue().unwrap(), Some(Value::Int(3)));
    }
}
