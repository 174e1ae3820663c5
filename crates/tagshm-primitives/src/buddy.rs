//! Buddy allocator for variable-length payloads stored beside the cells.
//!
//! The heap is a power-of-two number of fixed blocks described by a complete
//! binary tree of node states, one byte per node, that lives in the region
//! right after the header. All tree updates happen under a spin lock word in
//! the header, so any process mapping the region may allocate or free.
//!
//! ```text
//! [BuddyHeapHeader 64B][node tree: 2^(levels+1)-1 bytes][pad][data: 2^levels blocks]
//! ```

use core::fmt;
use core::mem::size_of;

use crate::region::Region;
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

/// Smallest unit handed out by the heap, in bytes.
pub const BLOCK_SIZE: u32 = 32;

/// Deepest tree supported (2^40 blocks is far beyond any mapping we create).
pub const MAX_LEVELS: u32 = 40;

const NODE_UNUSED: u8 = 0;
const NODE_USED: u8 = 1;
const NODE_SPLIT: u8 = 2;
const NODE_FULL: u8 = 3;

/// Heap header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct BuddyHeapHeader {
    /// Tree depth; the heap holds `1 << levels` blocks.
    pub levels: u32,
    pub block_size: u32,
    /// Spin lock guarding the node tree.
    pub lock: AtomicU32,
    _pad: u32,
    /// Blocks currently handed out.
    pub used_blocks: AtomicU64,
    /// Live allocations.
    pub allocations: AtomicU64,
    _pad2: [u8; 32],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<BuddyHeapHeader>() == 64);

impl BuddyHeapHeader {
    pub fn init(&mut self, levels: u32) {
        self.levels = levels;
        self.block_size = BLOCK_SIZE;
        self.lock = AtomicU32::new(0);
        self._pad = 0;
        self.used_blocks = AtomicU64::new(0);
        self.allocations = AtomicU64::new(0);
        self._pad2 = [0; 32];
    }
}

/// Byte layout of a heap holding at least some number of payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub levels: u32,
    /// Offset of the node tree, relative to the header.
    pub tree_offset: usize,
    /// Offset of the first data block, relative to the header.
    pub data_offset: usize,
    /// Total bytes from the header to the end of the data.
    pub total_size: usize,
}

impl HeapLayout {
    /// Layout for a heap able to hold `capacity` payload bytes (rounded up to
    /// a power-of-two number of blocks).
    pub fn for_capacity(capacity: usize) -> Result<Self, HeapError> {
        let blocks = capacity
            .div_ceil(BLOCK_SIZE as usize)
            .max(1)
            .checked_next_power_of_two()
            .ok_or(HeapError::TooLarge {
                requested: capacity,
                capacity: usize::MAX,
            })?;
        Self::with_levels(blocks.trailing_zeros())
    }

    pub fn with_levels(levels: u32) -> Result<Self, HeapError> {
        if levels > MAX_LEVELS {
            return Err(HeapError::InvalidHeader("heap tree too deep"));
        }
        let overflow = HeapError::InvalidHeader("heap size overflows usize");
        let nodes = node_count(levels).ok_or(overflow)?;
        let tree_offset = size_of::<BuddyHeapHeader>();
        let data_offset = align_up(tree_offset.checked_add(nodes).ok_or(overflow)?, 64);
        let data_bytes = (BLOCK_SIZE as usize)
            .checked_shl(levels)
            .ok_or(overflow)?;
        let total_size = data_offset.checked_add(data_bytes).ok_or(overflow)?;
        Ok(Self {
            levels,
            tree_offset,
            data_offset,
            total_size,
        })
    }

    pub fn capacity(&self) -> usize {
        (BLOCK_SIZE as usize) << self.levels
    }
}

/// Errors from heap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Request is larger than the whole heap.
    TooLarge { requested: usize, capacity: usize },
    /// No free run of blocks big enough.
    OutOfMemory { requested: usize },
    /// Offset does not name a live allocation.
    InvalidFree { offset: u64 },
    /// Header or layout is not usable.
    InvalidHeader(&'static str),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "allocation of {requested} bytes exceeds heap capacity {capacity}"
            ),
            Self::OutOfMemory { requested } => {
                write!(f, "heap exhausted allocating {requested} bytes")
            }
            Self::InvalidFree { offset } => write!(f, "no live allocation at heap offset {offset}"),
            Self::InvalidHeader(msg) => write!(f, "invalid heap header: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HeapError {}

/// A buddy heap living inside a region.
pub struct BuddyHeap {
    region: Region,
    header_offset: usize,
    layout: HeapLayout,
}

unsafe impl Send for BuddyHeap {}
unsafe impl Sync for BuddyHeap {}

impl BuddyHeap {
    /// Initialize a new heap at `header_offset`.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        layout: HeapLayout,
    ) -> Result<Self, HeapError> {
        check_fits(&region, header_offset, &layout)?;

        let header = unsafe { region.get_mut::<BuddyHeapHeader>(header_offset) };
        header.init(layout.levels);

        let tree = region.offset(header_offset + layout.tree_offset);
        let nodes = node_count(layout.levels).ok_or(HeapError::InvalidHeader("tree overflow"))?;
        // SAFETY: check_fits covered the tree bytes.
        unsafe { core::ptr::write_bytes(tree, NODE_UNUSED, nodes) };

        Ok(Self {
            region,
            header_offset,
            layout,
        })
    }

    /// Attach to a heap initialized by another process.
    ///
    /// # Safety
    ///
    /// The region must contain a heap header written by [`BuddyHeap::init`].
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, HeapError> {
        let header = unsafe { region.get::<BuddyHeapHeader>(header_offset) };
        if header.block_size != BLOCK_SIZE {
            return Err(HeapError::InvalidHeader("block size mismatch"));
        }
        let layout = HeapLayout::with_levels(header.levels)?;
        check_fits(&region, header_offset, &layout)?;
        Ok(Self {
            region,
            header_offset,
            layout,
        })
    }

    #[inline]
    fn header(&self) -> &BuddyHeapHeader {
        unsafe { self.region.get::<BuddyHeapHeader>(self.header_offset) }
    }

    /// Allocate at least `len` bytes. Returns the byte offset of the block
    /// relative to the start of the data area.
    pub fn alloc(&self, len: usize) -> Result<u64, HeapError> {
        let capacity = self.layout.capacity();
        if len > capacity {
            return Err(HeapError::TooLarge {
                requested: len,
                capacity,
            });
        }
        let blocks = len.div_ceil(BLOCK_SIZE as usize).max(1).next_power_of_two();
        let want_level = self.layout.levels - blocks.trailing_zeros();

        let mut tree = self.lock();
        let node = tree
            .claim(0, 0, want_level)
            .ok_or(HeapError::OutOfMemory { requested: len })?;
        let block = tree.block_of(node, want_level);
        drop(tree);

        let header = self.header();
        header
            .used_blocks
            .fetch_add(blocks as u64, Ordering::Relaxed);
        header.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(block as u64 * BLOCK_SIZE as u64)
    }

    /// Return an allocation to the heap.
    pub fn free(&self, offset: u64) -> Result<(), HeapError> {
        if offset % BLOCK_SIZE as u64 != 0 || offset >= self.layout.capacity() as u64 {
            return Err(HeapError::InvalidFree { offset });
        }
        let block = (offset / BLOCK_SIZE as u64) as usize;
        let blocks = self.lock().release(block).ok_or(HeapError::InvalidFree { offset })?;

        let header = self.header();
        header
            .used_blocks
            .fetch_sub(blocks as u64, Ordering::Relaxed);
        header.allocations.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pointer to the data at `offset` (as returned by [`alloc`](Self::alloc)).
    ///
    /// # Safety
    ///
    /// `offset..offset+len` must lie inside an allocation the caller owns.
    pub unsafe fn data_ptr(&self, offset: u64) -> *mut u8 {
        self.region
            .offset(self.header_offset + self.layout.data_offset + offset as usize)
    }

    /// Total payload bytes the heap can hold.
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Bytes currently handed out, including rounding to whole blocks.
    pub fn used_bytes(&self) -> usize {
        self.header().used_blocks.load(Ordering::Relaxed) as usize * BLOCK_SIZE as usize
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> u64 {
        self.header().allocations.load(Ordering::Relaxed)
    }

    fn lock(&self) -> TreeGuard<'_> {
        let lock = &self.header().lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        TreeGuard {
            lock,
            nodes: self
                .region
                .offset(self.header_offset + self.layout.tree_offset),
            levels: self.layout.levels,
        }
    }
}

/// Exclusive access to the node tree for as long as the guard lives.
struct TreeGuard<'a> {
    lock: &'a AtomicU32,
    nodes: *mut u8,
    levels: u32,
}

impl TreeGuard<'_> {
    #[inline]
    fn get(&self, node: usize) -> u8 {
        unsafe { self.nodes.add(node).read() }
    }

    #[inline]
    fn set(&mut self, node: usize, state: u8) {
        unsafe { self.nodes.add(node).write(state) }
    }

    /// Find and mark a node at `want` depth under `node` (which sits at `level`).
    fn claim(&mut self, node: usize, level: u32, want: u32) -> Option<usize> {
        match self.get(node) {
            NODE_USED | NODE_FULL => None,
            NODE_UNUSED if level == want => {
                self.set(node, NODE_USED);
                Some(node)
            }
            NODE_SPLIT if level == want => None,
            state => {
                if state == NODE_UNUSED {
                    self.set(node, NODE_SPLIT);
                    self.set(2 * node + 1, NODE_UNUSED);
                    self.set(2 * node + 2, NODE_UNUSED);
                }
                let left = 2 * node + 1;
                let found = self
                    .claim(left, level + 1, want)
                    .or_else(|| self.claim(left + 1, level + 1, want));
                if found.is_some() && self.is_taken(left) && self.is_taken(left + 1) {
                    self.set(node, NODE_FULL);
                }
                found
            }
        }
    }

    #[inline]
    fn is_taken(&self, node: usize) -> bool {
        matches!(self.get(node), NODE_USED | NODE_FULL)
    }

    /// Index of the first block covered by `node` at depth `level`.
    fn block_of(&self, node: usize, level: u32) -> usize {
        let first_at_level = (1usize << level) - 1;
        (node - first_at_level) << (self.levels - level)
    }

    /// Free the allocation starting at `block`. Returns the number of blocks
    /// released, or `None` if no allocation starts there.
    fn release(&mut self, block: usize) -> Option<usize> {
        let mut node = 0usize;
        let mut level = 0u32;
        let mut left = 0usize;
        loop {
            match self.get(node) {
                NODE_USED => {
                    if left != block {
                        return None;
                    }
                    break;
                }
                NODE_UNUSED => return None,
                _ => {
                    if level == self.levels {
                        return None;
                    }
                    let half = 1usize << (self.levels - level - 1);
                    if block < left + half {
                        node = 2 * node + 1;
                    } else {
                        left += half;
                        node = 2 * node + 2;
                    }
                    level += 1;
                }
            }
        }

        self.set(node, NODE_UNUSED);
        let mut child = node;
        while child > 0 {
            let parent = (child - 1) / 2;
            let first = 2 * parent + 1;
            let merged = self.get(first) == NODE_UNUSED && self.get(first + 1) == NODE_UNUSED;
            self.set(parent, if merged { NODE_UNUSED } else { NODE_SPLIT });
            child = parent;
        }
        Some(1usize << (self.levels - level))
    }
}

impl Drop for TreeGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

fn check_fits(region: &Region, header_offset: usize, layout: &HeapLayout) -> Result<(), HeapError> {
    if header_offset % 64 != 0 {
        return Err(HeapError::InvalidHeader("heap header must be 64-byte aligned"));
    }
    match header_offset.checked_add(layout.total_size) {
        Some(end) if end <= region.len() => Ok(()),
        _ => Err(HeapError::InvalidHeader("region too small for heap")),
    }
}

#[inline]
fn node_count(levels: u32) -> Option<usize> {
    2usize.checked_shl(levels).map(|n| n - 1)
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}
