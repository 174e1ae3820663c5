//! Full/Empty tag words and the per-cell slot they live in.
//!
//! A tag is a single `u32` so every state change is one compare-and-swap:
//!
//! ```text
//!  31                     8   5  4..2   1    0
//! +------------------------+---+------+----+----+
//! | reader count (24 bits) | W | kind | B  | E  |
//! +------------------------+---+------+----+----+
//! E = Empty (clear means Full)   B = busy (exclusive holder)
//! W = writer waiting             kind = value kind of the slot
//! ```
//!
//! The Full/Empty bit is never touched while busy, so an observer always sees
//! exactly one of Full or Empty. Busy and shared (reader) holds exclude each
//! other. A writer that finds readers sets `W`, which stops new readers from
//! joining until the count drains to zero.

use core::fmt;

use crate::sync::{AtomicU32, AtomicU64, Ordering};

const EMPTY_BIT: u32 = 1 << 0;
const BUSY_BIT: u32 = 1 << 1;
const KIND_SHIFT: u32 = 2;
const KIND_MASK: u32 = 0b111 << KIND_SHIFT;
const WRITER_WAITING_BIT: u32 = 1 << 5;
const READER_SHIFT: u32 = 8;
const READER_ONE: u32 = 1 << READER_SHIFT;

/// Largest number of simultaneous shared holders of one cell.
pub const MAX_READERS: u32 = (1 << (32 - READER_SHIFT)) - 1;

/// Largest kind code a tag can carry.
pub const MAX_KIND: u8 = 0b111;

/// Full/Empty state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fe {
    Full,
    Empty,
}

/// Decoded snapshot of a tag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TagWord(u32);

impl TagWord {
    pub const fn new(fe: Fe, kind: u8) -> Self {
        let fe_bits = match fe {
            Fe::Full => 0,
            Fe::Empty => EMPTY_BIT,
        };
        Self(fe_bits | (((kind & MAX_KIND) as u32) << KIND_SHIFT))
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn fe(self) -> Fe {
        if self.0 & EMPTY_BIT != 0 {
            Fe::Empty
        } else {
            Fe::Full
        }
    }

    #[inline]
    pub const fn is_busy(self) -> bool {
        self.0 & BUSY_BIT != 0
    }

    #[inline]
    pub const fn kind(self) -> u8 {
        ((self.0 & KIND_MASK) >> KIND_SHIFT) as u8
    }

    #[inline]
    pub const fn readers(self) -> u32 {
        self.0 >> READER_SHIFT
    }

    #[inline]
    pub const fn writer_waiting(self) -> bool {
        self.0 & WRITER_WAITING_BIT != 0
    }
}

impl fmt::Debug for TagWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagWord")
            .field("fe", &self.fe())
            .field("busy", &self.is_busy())
            .field("kind", &self.kind())
            .field("readers", &self.readers())
            .field("writer_waiting", &self.writer_waiting())
            .finish()
    }
}

/// Which Full/Empty states an acquisition accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Any,
    Full,
    Empty,
}

impl Gate {
    #[inline]
    pub const fn admits(self, fe: Fe) -> bool {
        matches!(
            (self, fe),
            (Gate::Any, _) | (Gate::Full, Fe::Full) | (Gate::Empty, Fe::Empty)
        )
    }
}

/// Why a single acquisition attempt did not succeed. Callers retry or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// Another holder has the slot exclusively.
    Busy,
    /// Shared holders are present.
    Readers(u32),
    /// The Full/Empty state is not the one requested.
    WrongState(Fe),
    /// An exclusive requester is queued behind the current readers.
    WriterWaiting,
    /// The reader count is saturated.
    ReaderLimit,
}

/// Errors from releasing a shared hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagError {
    /// `release_shared` was called with no shared holders.
    NotShared,
}

impl fmt::Display for TagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotShared => write!(f, "cell has no shared holders"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TagError {}

/// One tagged cell: a tag word plus an 8-byte payload word (16 bytes).
///
/// The payload word is only written while the tag is held busy, and only read
/// while the tag is held busy or shared, so it can use relaxed ordering; the tag
/// transitions provide the happens-before edges.
#[repr(C)]
pub struct CellSlot {
    tag: AtomicU32,
    _reserved: u32,
    value: AtomicU64,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<CellSlot>() == 16);

impl CellSlot {
    pub fn new(fe: Fe) -> Self {
        Self {
            tag: AtomicU32::new(TagWord::new(fe, 0).bits()),
            _reserved: 0,
            value: AtomicU64::new(0),
        }
    }

    /// Initialize a slot in place (region setup, before peers can see it).
    pub fn init(&mut self, fe: Fe, kind: u8, value: u64) {
        self.tag = AtomicU32::new(TagWord::new(fe, kind).bits());
        self._reserved = 0;
        self.value = AtomicU64::new(value);
    }

    #[inline]
    pub fn tag(&self) -> TagWord {
        TagWord(self.tag.load(Ordering::Acquire))
    }

    /// Single attempt to take the slot exclusively.
    ///
    /// Succeeds when the slot is not busy, has no shared holders, and its
    /// Full/Empty state is admitted by `gate`. Returns the tag as it was before
    /// the acquisition. If shared holders block the attempt, the writer-waiting
    /// bit is raised so no new readers join.
    pub fn try_lock(&self, gate: Gate) -> Result<TagWord, Blocked> {
        let mut current = self.tag.load(Ordering::Acquire);
        loop {
            let word = TagWord(current);
            if word.is_busy() {
                return Err(Blocked::Busy);
            }
            if word.readers() > 0 {
                if word.writer_waiting() {
                    return Err(Blocked::Readers(word.readers()));
                }
                match self.tag.compare_exchange_weak(
                    current,
                    current | WRITER_WAITING_BIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Err(Blocked::Readers(word.readers())),
                    Err(actual) => {
                        current = actual;
                        continue;
                    }
                }
            }
            if !gate.admits(word.fe()) {
                return Err(Blocked::WrongState(word.fe()));
            }
            match self.tag.compare_exchange_weak(
                current,
                current | BUSY_BIT,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(word),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release an exclusive hold, publishing the new state and value kind.
    ///
    /// Must only be called by the holder of a successful [`try_lock`](Self::try_lock).
    pub fn unlock(&self, fe: Fe, kind: u8) {
        debug_assert!(self.tag().is_busy(), "unlock without exclusive hold");
        self.tag
            .store(TagWord::new(fe, kind).bits(), Ordering::Release);
    }

    /// Single attempt to take a shared (reader) hold.
    ///
    /// A queued exclusive requester turns away gated readers. `Gate::Any`
    /// holds are momentary peeks and still get through, so a reader already
    /// holding the slot can look at it again.
    pub fn try_lock_shared(&self, gate: Gate) -> Result<TagWord, Blocked> {
        let mut current = self.tag.load(Ordering::Acquire);
        loop {
            let word = TagWord(current);
            if word.is_busy() {
                return Err(Blocked::Busy);
            }
            if word.writer_waiting() && !matches!(gate, Gate::Any) {
                return Err(Blocked::WriterWaiting);
            }
            if !gate.admits(word.fe()) {
                return Err(Blocked::WrongState(word.fe()));
            }
            if word.readers() == MAX_READERS {
                return Err(Blocked::ReaderLimit);
            }
            match self.tag.compare_exchange_weak(
                current,
                current + READER_ONE,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(word),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one shared hold. Returns the tag after the release.
    pub fn release_shared(&self) -> Result<TagWord, TagError> {
        let mut current = self.tag.load(Ordering::Acquire);
        loop {
            let word = TagWord(current);
            if word.readers() == 0 {
                return Err(TagError::NotShared);
            }
            let mut next = current - READER_ONE;
            if word.readers() == 1 {
                next &= !WRITER_WAITING_BIT;
            }
            match self.tag.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(TagWord(next)),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Store the payload word. Caller must hold the slot exclusively.
    #[inline]
    pub fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_tag_word_round_trips_fields() {
        let word = TagWord::new(Fe::Empty, 5);
        assert_eq!(word.fe(), Fe::Empty);
        assert_eq!(word.kind(), 5);
        assert!(!word.is_busy());
        assert_eq!(word.readers(), 0);
    }

    #[test]
    fn test_zeroed_slot_is_full() {
        assert_eq!(TagWord::from_bits(0).fe(), Fe::Full);
    }

    #[test]
    fn test_lock_respects_gate() {
        let slot = CellSlot::new(Fe::Empty);
        assert_eq!(slot.try_lock(Gate::Full), Err(Blocked::WrongState(Fe::Empty)));
        let prior = slot.try_lock(Gate::Empty).unwrap();
        assert_eq!(prior.fe(), Fe::Empty);
        assert_eq!(slot.try_lock(Gate::Any), Err(Blocked::Busy));
        slot.set_value(42);
        slot.unlock(Fe::Full, 2);
        let tag = slot.tag();
        assert_eq!(tag.fe(), Fe::Full);
        assert_eq!(tag.kind(), 2);
        assert_eq!(slot.value(), 42);
    }

    #[test]
    fn test_readers_share_and_block_writers() {
        let slot = CellSlot::new(Fe::Full);
        slot.try_lock_shared(Gate::Full).unwrap();
        slot.try_lock_shared(Gate::Full).unwrap();
        assert_eq!(slot.tag().readers(), 2);

        assert_eq!(slot.try_lock(Gate::Any), Err(Blocked::Readers(2)));
        assert!(slot.tag().writer_waiting());
        assert_eq!(slot.try_lock_shared(Gate::Full), Err(Blocked::WriterWaiting));

        slot.release_shared().unwrap();
        let after = slot.release_shared().unwrap();
        assert_eq!(after.readers(), 0);
        assert!(!after.writer_waiting());
        assert_eq!(after.fe(), Fe::Full);
        assert!(slot.try_lock(Gate::Full).is_ok());
    }

    #[test]
    fn test_peek_passes_queued_writer() {
        let slot = CellSlot::new(Fe::Full);
        slot.try_lock_shared(Gate::Full).unwrap();
        assert_eq!(slot.try_lock(Gate::Any), Err(Blocked::Readers(1)));

        let peek = slot.try_lock_shared(Gate::Any).unwrap();
        assert!(peek.writer_waiting());
        slot.release_shared().unwrap();
        assert!(slot.tag().writer_waiting());

        slot.release_shared().unwrap();
        assert!(slot.try_lock(Gate::Any).is_ok());
    }

    #[test]
    fn test_release_without_readers_fails() {
        let slot = CellSlot::new(Fe::Full);
        assert_eq!(slot.release_shared(), Err(TagError::NotShared));
    }

    #[test]
    fn test_reader_count_exceeds_small_caps() {
        let slot = CellSlot::new(Fe::Full);
        for _ in 0..1000 {
            slot.try_lock_shared(Gate::Any).unwrap();
        }
        assert_eq!(slot.tag().readers(), 1000);
    }
}
