//! The Full/Empty cell protocol.
//!
//! | operation   | waits for        | tag afterwards |
//! |-------------|------------------|----------------|
//! | `read`      | nothing          | unchanged      |
//! | `read_ff`   | Full             | Full           |
//! | `read_fe`   | Full             | Empty          |
//! | `write`     | nothing          | unchanged      |
//! | `write_xf`  | nothing          | Full           |
//! | `write_xe`  | nothing          | Empty          |
//! | `write_ef`  | Empty            | Full           |
//! | `set_tag`   | nothing          | as given       |
//!
//! "Nothing" still means waiting out other holders' short exclusive sections,
//! and, for writers, any shared readers. Every wait is bounded by the handle's
//! timeout.

use tagshm_primitives::{CellSlot, Fe, Gate};

use crate::error::{Error, Result};
use crate::region::Region;
use crate::value::{Encoded, Value, ValueKind};
use crate::wait::wait_for;

/// Synchronization state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Full,
    Empty,
}

impl From<Fe> for Tag {
    fn from(fe: Fe) -> Self {
        match fe {
            Fe::Full => Self::Full,
            Fe::Empty => Self::Empty,
        }
    }
}

impl From<Tag> for Fe {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::Full => Fe::Full,
            Tag::Empty => Fe::Empty,
        }
    }
}

/// Exclusive hold on one slot. Dropping the guard publishes the current
/// Full/Empty state and value kind.
pub(crate) struct CellGuard<'r> {
    region: &'r Region,
    slot: &'r CellSlot,
    index: usize,
    fe: Fe,
    kind: u8,
}

impl CellGuard<'_> {
    pub fn load(&self) -> Result<Value> {
        self.region.decode(self.index, self.kind, self.slot.value())
    }

    /// Replace the stored value, releasing any heap payload it owned.
    pub fn store(&mut self, value: &Value) -> Result<()> {
        let staged = self.region.stage(value)?;
        self.store_staged(staged)
    }

    /// Install an already staged value. The staged payload is released if the
    /// old one cannot be.
    pub fn store_staged(&mut self, staged: Staged) -> Result<()> {
        let old_kind = ValueKind::from_code(self.kind);
        if old_kind.is_some_and(ValueKind::is_heap) {
            if let Err(e) = self.region.free_payload(self.slot.value()) {
                tracing::warn!(index = self.index, error = %e, "stale payload could not be freed");
                self.region.discard(staged);
                return Err(Error::CorruptPayload {
                    index: self.index,
                    reason: "payload does not match a heap allocation",
                });
            }
        }
        self.slot.set_value(staged.word);
        self.kind = staged.kind.code();
        Ok(())
    }

    #[inline]
    pub fn set_fe(&mut self, fe: Fe) {
        self.fe = fe;
    }
}

impl Drop for CellGuard<'_> {
    fn drop(&mut self) {
        self.slot.unlock(self.fe, self.kind);
    }
}

/// A value encoded into its payload word, with any heap payload already
/// allocated. Install it with [`CellGuard::store_staged`] or release it with
/// [`Region::discard`].
#[must_use]
pub(crate) struct Staged {
    word: u64,
    kind: ValueKind,
}

impl Region {
    /// Encode `value`, copying heap-backed payloads into the heap.
    pub(crate) fn stage(&self, value: &Value) -> Result<Staged> {
        let word = match value.encode() {
            Encoded::Inline(word) => word,
            Encoded::Heap(bytes) => self.store_payload(bytes)?,
        };
        Ok(Staged {
            word,
            kind: value.kind(),
        })
    }

    /// Release a staged value that will not be installed.
    pub(crate) fn discard(&self, staged: Staged) {
        if staged.kind.is_heap() {
            if let Err(e) = self.free_payload(staged.word) {
                tracing::warn!(error = %e, "staged payload could not be freed");
            }
        }
    }

    /// Wait for Empty, install `staged`, and mark the cell Full. The staged
    /// payload is released if the wait fails.
    pub(crate) fn write_ef_staged(&self, op: &'static str, index: usize, staged: Staged) -> Result<()> {
        let mut guard = match self.lock_cell(op, index, Gate::Empty) {
            Ok(guard) => guard,
            Err(e) => {
                self.discard(staged);
                return Err(e);
            }
        };
        guard.store_staged(staged)?;
        guard.set_fe(Fe::Full);
        Ok(())
    }

    /// Take `slot` exclusively once its Full/Empty state is admitted by `gate`.
    pub(crate) fn lock_slot<'r>(
        &'r self,
        op: &'static str,
        slot: &'r CellSlot,
        index: usize,
        gate: Gate,
    ) -> Result<CellGuard<'r>> {
        let prior = wait_for(op, Some(index), self.timeout(), || slot.try_lock(gate).ok())?;
        Ok(CellGuard {
            region: self,
            slot,
            index,
            fe: prior.fe(),
            kind: prior.kind(),
        })
    }

    pub(crate) fn lock_cell(&self, op: &'static str, index: usize, gate: Gate) -> Result<CellGuard<'_>> {
        let slot = self.slot(index)?;
        self.lock_slot(op, slot, index, gate)
    }

    /// Copy the value out under a short shared hold.
    fn read_shared(&self, op: &'static str, index: usize, gate: Gate) -> Result<Value> {
        let slot = self.slot(index)?;
        let prior = wait_for(op, Some(index), self.timeout(), || {
            slot.try_lock_shared(gate).ok()
        })?;
        let value = self.decode(index, prior.kind(), slot.value());
        let _ = slot.release_shared();
        value
    }

    pub(crate) fn decode(&self, index: usize, kind: u8, word: u64) -> Result<Value> {
        let kind = ValueKind::from_code(kind).ok_or(Error::CorruptPayload {
            index,
            reason: "unknown value kind",
        })?;
        if kind.is_heap() {
            let bytes = self.load_payload(index, word)?;
            Value::decode_heap(kind, bytes).map_err(|reason| Error::CorruptPayload { index, reason })
        } else {
            Value::decode_inline(kind, word).ok_or(Error::CorruptPayload {
                index,
                reason: "inline kind without inline payload",
            })
        }
    }

    /// Current value regardless of the tag.
    pub fn read(&self, index: usize) -> Result<Value> {
        self.read_shared("read", index, Gate::Any)
    }

    /// Wait for Full and return the value, leaving the cell Full.
    pub fn read_ff(&self, index: usize) -> Result<Value> {
        self.read_shared("read_ff", index, Gate::Full)
    }

    /// Wait for Full, return the value, and mark the cell Empty.
    ///
    /// Exactly one `read_fe` consumes each Full occupancy.
    pub fn read_fe(&self, index: usize) -> Result<Value> {
        let mut guard = self.lock_cell("read_fe", index, Gate::Full)?;
        let value = guard.load()?;
        guard.set_fe(Fe::Empty);
        Ok(value)
    }

    /// Store without changing the tag.
    pub fn write(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut guard = self.lock_cell("write", index, Gate::Any)?;
        guard.store(&value)
    }

    /// Store and force the tag to Full.
    pub fn write_xf(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.write_forced("write_xf", index, value.into(), Fe::Full)
    }

    /// Store and force the tag to Empty.
    pub fn write_xe(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.write_forced("write_xe", index, value.into(), Fe::Empty)
    }

    fn write_forced(&self, op: &'static str, index: usize, value: Value, fe: Fe) -> Result<()> {
        let mut guard = self.lock_cell(op, index, Gate::Any)?;
        guard.store(&value)?;
        guard.set_fe(fe);
        Ok(())
    }

    /// Wait for Empty, store, and mark the cell Full.
    pub fn write_ef(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut guard = self.lock_cell("write_ef", index, Gate::Empty)?;
        guard.store(&value)?;
        guard.set_fe(Fe::Full);
        Ok(())
    }

    /// Force the tag without touching the value.
    pub fn set_tag(&self, index: usize, tag: Tag) -> Result<()> {
        let mut guard = self.lock_cell("set_tag", index, Gate::Any)?;
        guard.set_fe(tag.into());
        Ok(())
    }

    /// Current tag of a cell.
    pub fn tag(&self, index: usize) -> Result<Tag> {
        Ok(self.slot(index)?.tag().fe().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn region(label: &str, cells: usize, initial_tag: Tag) -> Region {
        let path = std::env::temp_dir().join(format!(
            "test_cell_{}_{}.shm",
            label,
            std::process::id()
        ));
        Region::create(
            &path,
            RegionConfig {
                cells,
                initial_tag,
                heap_size: 4096,
                persist: false,
                timeout: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_handoff_empties_cell() {
        let r = region("handoff", 4, Tag::Empty);
        r.write_ef(0, 42i64).unwrap();
        assert_eq!(r.tag(0).unwrap(), Tag::Full);
        assert_eq!(r.read_fe(0).unwrap(), Value::Int(42));
        assert_eq!(r.tag(0).unwrap(), Tag::Empty);
    }

    #[test]
    fn test_read_fe_on_empty_times_out() {
        let r = region("fe_timeout", 1, Tag::Empty);
        r.set_timeout(Some(Duration::from_millis(20)));
        let err = r.read_fe(0).unwrap_err();
        assert!(err.is_timeout());
        // Timing out leaves the tag intact.
        assert_eq!(r.tag(0).unwrap(), Tag::Empty);
        r.write_ef(0, 1i64).unwrap();
    }

    #[test]
    fn test_write_ef_on_full_times_out() {
        let r = region("ef_timeout", 1, Tag::Full);
        r.set_timeout(Some(Duration::from_millis(20)));
        assert!(r.write_ef(0, 1i64).unwrap_err().is_timeout());
    }

    #[test]
    fn test_read_ff_is_not_destructive() {
        let r = region("ff", 1, Tag::Empty);
        r.write_xf(0, "hello").unwrap();
        assert_eq!(r.read_ff(0).unwrap(), Value::from("hello"));
        assert_eq!(r.read_ff(0).unwrap(), Value::from("hello"));
        assert_eq!(r.tag(0).unwrap(), Tag::Full);
    }

    #[test]
    fn test_write_keeps_tag_and_forced_writes_set_it() {
        let r = region("forced", 2, Tag::Empty);
        r.write(0, 1.5f64).unwrap();
        assert_eq!(r.tag(0).unwrap(), Tag::Empty);
        assert_eq!(r.read(0).unwrap(), Value::Float(1.5));
        r.write_xf(0, 2i64).unwrap();
        assert_eq!(r.tag(0).unwrap(), Tag::Full);
        r.write_xe(0, 3i64).unwrap();
        assert_eq!(r.tag(0).unwrap(), Tag::Empty);
        r.set_tag(0, Tag::Full).unwrap();
        assert_eq!(r.read_fe(0).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_overwriting_strings_releases_heap() {
        let r = region("heap", 1, Tag::Full);
        r.write(0, "a".repeat(100)).unwrap();
        let used = r.heap_used();
        assert!(used > 0);
        r.write(0, "b".repeat(100)).unwrap();
        assert_eq!(r.heap_used(), used);
        r.write(0, 5i64).unwrap();
        assert_eq!(r.heap_used(), 0);
    }

    #[test]
    fn test_composite_payloads_round_trip() {
        let r = region("composite", 2, Tag::Full);
        r.write(0, Value::Json(r#"{"a":[1,2]}"#.into())).unwrap();
        r.write(1, vec![0u8, 1, 2, 255]).unwrap();
        assert_eq!(r.read(0).unwrap(), Value::Json(r#"{"a":[1,2]}"#.into()));
        assert_eq!(r.read(1).unwrap(), Value::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn test_heap_exhaustion_leaves_cell_intact() {
        let r = region("exhaust", 1, Tag::Full);
        r.write(0, "keep").unwrap();
        let err = r.write(0, "x".repeat(10_000)).unwrap_err();
        assert!(matches!(err, Error::Heap(_)));
        assert_eq!(r.read(0).unwrap(), Value::from("keep"));
    }

    #[test]
    fn test_out_of_bounds_index() {
        let r = region("oob", 2, Tag::Full);
        assert!(matches!(
            r.read(2),
            Err(Error::IndexOutOfBounds { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_blocked_reader_wakes_on_write() {
        let r = Arc::new(region("wake", 1, Tag::Empty));
        let reader = {
            let r = r.clone();
            std::thread::spawn(move || r.read_fe(0))
        };
        std::thread::sleep(Duration::from_millis(20));
        r.write_ef(0, "ping").unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), Value::from("ping"));
    }
}
