//! Error type shared by every region operation.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tagshm_primitives::HeapError;

use crate::layout::LayoutError;
use crate::value::ValueKind;

/// Errors from region operations.
#[derive(Debug)]
pub enum Error {
    /// I/O error while creating, mapping, or removing the backing file.
    Io(io::Error),
    /// The backing file does not hold a usable region.
    Layout(LayoutError),
    /// Attach-only open of a region that does not exist.
    RegionNotFound(PathBuf),
    /// Rejected configuration or argument.
    InvalidConfig(String),
    /// Cell index past the end of the region.
    IndexOutOfBounds { index: usize, len: usize },
    /// Coordinates do not match the region's dimensions.
    InvalidCoordinates(String),
    /// Mapped key has never been written.
    KeyNotFound,
    /// No free map slot within the probe limit.
    MapFull,
    /// Mapped key used on a region created without a key map.
    MapDisabled,
    /// A blocking wait exceeded its bound.
    Timeout {
        op: &'static str,
        index: Option<usize>,
        waited: Duration,
    },
    /// Operand kinds that an operation cannot combine.
    TypeMismatch {
        op: &'static str,
        stored: ValueKind,
        operand: ValueKind,
    },
    /// A stored payload could not be decoded.
    CorruptPayload { index: usize, reason: &'static str },
    /// Variable-length payload heap failure.
    Heap(HeapError),
    /// `release_rw` on a cell with no readers.
    NotLocked { index: usize },
    /// Push onto a stack whose cells are all in use.
    StackFull { capacity: usize },
    /// Enqueue onto a queue whose cells are all in use.
    QueueFull { capacity: usize },
    /// Worker identity outside the group.
    InvalidWorker { id: u32, group_size: u32 },
    /// The same cell appears twice in one transaction.
    DuplicateElement { region: String, index: usize },
    /// The critical-section word was cleared by another participant.
    LockLost,
}

impl Error {
    /// True for bounded-wait expiry, which callers may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::RegionNotFound(path) => write!(f, "region not found: {}", path.display()),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {} out of bounds for region of {} cells", index, len)
            }
            Self::InvalidCoordinates(msg) => write!(f, "invalid coordinates: {}", msg),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::MapFull => write!(f, "key map full"),
            Self::MapDisabled => write!(f, "region has no key map"),
            Self::Timeout { op, index, waited } => match index {
                Some(index) => write!(f, "{} on cell {} timed out after {:?}", op, index, waited),
                None => write!(f, "{} timed out after {:?}", op, waited),
            },
            Self::TypeMismatch {
                op,
                stored,
                operand,
            } => write!(f, "{} cannot combine {} with {}", op, stored, operand),
            Self::CorruptPayload { index, reason } => {
                write!(f, "corrupt payload in cell {}: {}", index, reason)
            }
            Self::Heap(e) => write!(f, "heap error: {}", e),
            Self::NotLocked { index } => write!(f, "cell {} is not read-locked", index),
            Self::StackFull { capacity } => write!(f, "stack full ({} cells)", capacity),
            Self::QueueFull { capacity } => write!(f, "queue full ({} cells)", capacity),
            Self::InvalidWorker { id, group_size } => {
                write!(f, "worker {} outside group of {}", id, group_size)
            }
            Self::DuplicateElement { region, index } => {
                write!(f, "cell {} of {} listed twice in transaction", index, region)
            }
            Self::LockLost => write!(f, "critical section lock lost"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Heap(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LayoutError> for Error {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<HeapError> for Error {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
