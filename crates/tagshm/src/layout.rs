//! Region memory layout definitions.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | REGION HEADER (256 bytes)                                         |
//! |   magic: "TAGSHM\0\0", version, geometry, section offsets         |
//! |   ready flag, stack top, queue head/tail cursors (atomic)         |
//! +-------------------------------------------------------------------+
//! | CONTROL BLOCK (128 bytes)                                         |
//! |   barrier count + generation, single counter, critical owner      |
//! |   shared loop state: next, end, chunk, min chunk, policy          |
//! +-------------------------------------------------------------------+
//! | CELLS (cell_count * 16 bytes)                                     |
//! |   Per cell: tag word (Full/Empty, busy, kind, readers) + payload  |
//! +-------------------------------------------------------------------+
//! | KEY MAP (cell_count * 16 bytes, only with use_map)                |
//! |   Per slot: tag word + key payload; slot i owns cell i            |
//! +-------------------------------------------------------------------+
//! | HEAP (BuddyHeapHeader + node tree + data blocks)                  |
//! +-------------------------------------------------------------------+
//! ```

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64};

use static_assertions::const_assert_eq;
use tagshm_primitives::{CellSlot, HeapLayout};

/// Magic bytes identifying a tagshm region.
pub const REGION_MAGIC: [u8; 8] = *b"TAGSHM\0\0";

/// Current layout version (major.minor packed into u32).
pub const REGION_VERSION: u32 = 1 << 16; // v1.0

/// Maximum number of dimensions for coordinate indexing.
pub const MAX_DIMS: usize = 8;

/// Header flag: the region carries a key map.
pub const FLAG_KEY_MAP: u32 = 1 << 0;

/// Region header at the start of the mapping (256 bytes).
#[repr(C, align(64))]
pub struct RegionHeader {
    /// Magic bytes: "TAGSHM\0\0".
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,
    /// Feature flags.
    pub flags: u32,

    /// Number of cells.
    pub cell_count: u64,
    /// Size of the worker group that coordinates through this region.
    pub group_size: u32,
    /// Number of used entries in `dims` (0 = one-dimensional).
    pub ndims: u32,
    /// Extent of each dimension.
    pub dims: [u64; MAX_DIMS],

    /// Offset to the cell array from start of file.
    pub cells_offset: u64,
    /// Offset to the key map from start of file (0 without a map).
    pub map_offset: u64,
    /// Offset to the heap header from start of file.
    pub heap_offset: u64,
    /// Total size of the file.
    pub total_size: u64,

    /// Set to 1 once the creator has finished initializing.
    pub ready: AtomicU32,
    pub _pad1: u32,

    /// Stack cursor: number of occupied cells.
    pub stack_top: AtomicU64,
    /// Queue cursors: monotonically increasing dequeue/enqueue tickets.
    pub queue_head: AtomicU64,
    pub queue_tail: AtomicU64,

    /// Padding to 256 bytes.
    pub _pad2: [u8; 96],
}

const_assert_eq!(size_of::<RegionHeader>(), 256);

/// Group coordination state (128 bytes).
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Workers that have reached the current barrier.
    pub barrier_arrived: AtomicU32,
    /// Workers that have reached the current `single`.
    pub single_arrived: AtomicU32,
    /// Barrier phase; bumped by the last arrival.
    pub barrier_generation: AtomicU64,

    /// Critical-section owner (worker id + 1, 0 = free).
    pub critical_owner: AtomicU32,
    /// Scheduling policy of the current loop.
    pub loop_policy: AtomicU32,

    /// Loop bounds and cursor, stored as two's-complement `i64`.
    pub loop_start: AtomicU64,
    pub loop_end: AtomicU64,
    pub loop_next: AtomicU64,
    /// Next chunk size (guided) and the floor for all chunks.
    pub loop_chunk: AtomicU64,
    pub loop_min_chunk: AtomicU64,

    /// Padding to 128 bytes.
    pub _pad: [u8; 64],
}

const_assert_eq!(size_of::<ControlBlock>(), 128);
const_assert_eq!(size_of::<CellSlot>(), 16);

impl RegionHeader {
    /// Initialize a new header. `ready` stays 0 until the creator publishes.
    pub fn init(&mut self, geometry: &Geometry, offsets: &RegionOffsets) {
        self.magic = REGION_MAGIC;
        self.version = REGION_VERSION;
        self.flags = if offsets.map.is_some() { FLAG_KEY_MAP } else { 0 };
        self.cell_count = geometry.cells as u64;
        self.group_size = geometry.group_size;
        self.ndims = geometry.dims.len() as u32;
        self.dims = [0; MAX_DIMS];
        for (slot, dim) in self.dims.iter_mut().zip(&geometry.dims) {
            *slot = *dim as u64;
        }
        self.cells_offset = offsets.cells as u64;
        self.map_offset = offsets.map.unwrap_or(0) as u64;
        self.heap_offset = offsets.heap as u64;
        self.total_size = offsets.total_size as u64;
        self.ready = AtomicU32::new(0);
        self._pad1 = 0;
        self.stack_top = AtomicU64::new(0);
        self.queue_head = AtomicU64::new(0);
        self.queue_tail = AtomicU64::new(0);
        self._pad2 = [0; 96];
    }

    /// Validate the header against the mapped length.
    pub fn validate(&self, mapped_len: usize) -> Result<(), LayoutError> {
        if self.magic != REGION_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        let major = self.version >> 16;
        let our_major = REGION_VERSION >> 16;
        if major != our_major {
            return Err(LayoutError::IncompatibleVersion {
                expected: REGION_VERSION,
                found: self.version,
            });
        }
        if self.cell_count == 0 {
            return Err(LayoutError::InvalidConfig("cell_count must be > 0"));
        }
        if self.group_size == 0 {
            return Err(LayoutError::InvalidConfig("group_size must be > 0"));
        }
        if self.ndims as usize > MAX_DIMS {
            return Err(LayoutError::InvalidConfig("too many dimensions"));
        }
        if self.total_size as usize > mapped_len {
            return Err(LayoutError::RegionTooSmall {
                required: self.total_size as usize,
                found: mapped_len,
            });
        }
        Ok(())
    }

    pub fn has_map(&self) -> bool {
        self.flags & FLAG_KEY_MAP != 0
    }

    pub fn dims(&self) -> Vec<usize> {
        self.dims[..self.ndims as usize]
            .iter()
            .map(|d| *d as usize)
            .collect()
    }
}

impl ControlBlock {
    pub fn init(&mut self) {
        self.barrier_arrived = AtomicU32::new(0);
        self.single_arrived = AtomicU32::new(0);
        self.barrier_generation = AtomicU64::new(0);
        self.critical_owner = AtomicU32::new(0);
        self.loop_policy = AtomicU32::new(0);
        self.loop_start = AtomicU64::new(0);
        self.loop_end = AtomicU64::new(0);
        self.loop_next = AtomicU64::new(0);
        self.loop_chunk = AtomicU64::new(0);
        self.loop_min_chunk = AtomicU64::new(0);
        self._pad = [0; 64];
    }
}

/// Logical shape of a region, independent of byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub cells: usize,
    pub dims: Vec<usize>,
    pub group_size: u32,
}

/// Computed byte offsets of every section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOffsets {
    pub control: usize,
    pub cells: usize,
    pub map: Option<usize>,
    pub heap: usize,
    pub heap_layout: HeapLayout,
    pub total_size: usize,
}

impl RegionOffsets {
    /// Calculate offsets for a region.
    pub fn calculate(cells: usize, use_map: bool, heap_capacity: usize) -> Result<Self, LayoutError> {
        if cells == 0 {
            return Err(LayoutError::InvalidConfig("cell_count must be > 0"));
        }
        let control = size_of::<RegionHeader>();
        let cells_offset = control + size_of::<ControlBlock>();
        let cell_bytes = cells
            .checked_mul(size_of::<CellSlot>())
            .ok_or(LayoutError::Overflow)?;
        let mut next = cells_offset
            .checked_add(cell_bytes)
            .ok_or(LayoutError::Overflow)?;

        let map = if use_map {
            let at = align_up(next, 64)?;
            next = at.checked_add(cell_bytes).ok_or(LayoutError::Overflow)?;
            Some(at)
        } else {
            None
        };

        let heap = align_up(next, 64)?;
        let heap_layout = HeapLayout::for_capacity(heap_capacity)
            .map_err(|_| LayoutError::InvalidConfig("heap size out of range"))?;
        let total_size = heap
            .checked_add(heap_layout.total_size)
            .ok_or(LayoutError::Overflow)?;

        Ok(Self {
            control,
            cells: cells_offset,
            map,
            heap,
            heap_layout,
            total_size,
        })
    }
}

fn align_up(value: usize, align: usize) -> Result<usize, LayoutError> {
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or(LayoutError::Overflow)
}

/// Errors from layout validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// File shorter than the header says it should be.
    RegionTooSmall { required: usize, found: usize },
    /// The creator has not finished initializing.
    NotReady,
    /// Size arithmetic overflowed.
    Overflow,
    /// Invalid configuration in header.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid region magic bytes (expected TAGSHM)"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible region version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xffff,
                found >> 16,
                found & 0xffff
            ),
            Self::RegionTooSmall { required, found } => write!(
                f,
                "region too small: need {} bytes, found {}",
                required, found
            ),
            Self::NotReady => write!(f, "region is still being initialized"),
            Self::Overflow => write!(f, "region size overflows"),
            Self::InvalidConfig(msg) => write!(f, "invalid region config: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}
