//! Lock-free building blocks for tagged shared memory.
//!
//! This crate provides `no_std`-compatible pieces that the `tagshm` engine lays
//! out inside a memory-mapped region shared by several processes:
//!
//! - [`CellSlot`] / [`TagWord`]: a 16-byte cell whose tag word carries the
//!   Full/Empty state, a busy bit for exclusive holders, a reader count for
//!   shared holders, and the kind of value stored in the payload word.
//! - [`BuddyHeap`]: a buddy allocator for variable-length payloads, guarded by
//!   a spin lock word that lives in the heap header.
//! - [`Region`]: a raw view over the mapped bytes, plus [`HeapRegion`] which
//!   owns ordinary heap memory for tests.
//!
//! Every operation here is a single non-blocking attempt. Waiting policy
//! (backoff, deadlines) belongs to the caller.
//!
//! # Loom Testing
//!
//! ```text
//! cargo test -p tagshm-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod buddy;
pub mod region;
pub mod sync;
pub mod tag;

pub use buddy::{BLOCK_SIZE, BuddyHeap, BuddyHeapHeader, HeapError, HeapLayout};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use tag::{Blocked, CellSlot, Fe, Gate, MAX_KIND, MAX_READERS, TagError, TagWord};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
