//! Length-prefixed payloads in the region heap.
//!
//! Each heap-backed value is one buddy allocation laid out as
//! `[len: u64 little-endian][bytes]`; the cell's payload word holds the
//! allocation offset.

use crate::error::{Error, Result};
use crate::region::Region;

const LEN_PREFIX: usize = 8;

impl Region {
    /// Copy `bytes` into a fresh heap allocation and return its offset.
    pub(crate) fn store_payload(&self, bytes: &[u8]) -> Result<u64> {
        let total = bytes
            .len()
            .checked_add(LEN_PREFIX)
            .ok_or_else(|| Error::InvalidConfig("payload too large".into()))?;
        let offset = self.heap.alloc(total)?;
        // SAFETY: `offset..offset+total` is a fresh allocation owned by us.
        unsafe {
            let ptr = self.heap.data_ptr(offset);
            let len = (bytes.len() as u64).to_le_bytes();
            std::ptr::copy_nonoverlapping(len.as_ptr(), ptr, LEN_PREFIX);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(LEN_PREFIX), bytes.len());
        }
        Ok(offset)
    }

    /// Copy the payload at `offset` out of the heap. `index` names the cell
    /// for error reports.
    pub(crate) fn load_payload(&self, index: usize, offset: u64) -> Result<Vec<u8>> {
        let capacity = self.heap.capacity() as u64;
        let corrupt = |reason| Error::CorruptPayload { index, reason };

        let body = offset
            .checked_add(LEN_PREFIX as u64)
            .filter(|end| *end <= capacity)
            .ok_or_else(|| corrupt("payload offset outside heap"))?;

        let mut len = [0u8; LEN_PREFIX];
        // SAFETY: the prefix lies inside the heap (checked above).
        unsafe {
            std::ptr::copy_nonoverlapping(self.heap.data_ptr(offset), len.as_mut_ptr(), LEN_PREFIX);
        }
        let len = u64::from_le_bytes(len);
        if len > capacity - body {
            return Err(corrupt("payload length exceeds heap"));
        }

        let mut bytes = vec![0u8; len as usize];
        // SAFETY: `body..body+len` lies inside the heap (checked above).
        unsafe {
            std::ptr::copy_nonoverlapping(self.heap.data_ptr(body), bytes.as_mut_ptr(), bytes.len());
        }
        Ok(bytes)
    }

    pub(crate) fn free_payload(&self, offset: u64) -> Result<()> {
        self.heap.free(offset).map_err(Error::Heap)
    }

    /// Heap bytes in use, including block rounding.
    pub fn heap_used(&self) -> usize {
        self.heap.used_bytes()
    }

    /// Total heap capacity in bytes.
    pub fn heap_capacity(&self) -> usize {
        self.heap.capacity()
    }
}
