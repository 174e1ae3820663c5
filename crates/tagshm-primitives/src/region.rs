//! Raw views over a block of memory that may be shared between processes.

use core::ptr::NonNull;

/// A borrowed view of a contiguous, 64-byte aligned block of memory.
///
/// `Region` does not own its memory. In shared-memory use the base pointer comes
/// from `mmap` and the caller keeps the mapping alive for as long as any view
/// (or any structure built on a view) exists.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a Region is just an address range; all shared state inside it is
// accessed through atomics or under a lock word that lives in the range.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Build a view over `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, 64-byte aligned,
    /// and must outlive every use of the returned view.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        assert!(!base.is_null(), "region base must not be null");
        assert!(base as usize % 64 == 0, "region base must be 64-byte aligned");
        Self {
            // SAFETY: checked non-null above.
            base: unsafe { NonNull::new_unchecked(base) },
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to the byte at `offset`.
    ///
    /// Panics if `offset` is past the end of the region.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} out of region (len {})", self.len);
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Shared reference to a `T` placed at `offset`.
    ///
    /// # Safety
    ///
    /// A properly initialized `T` must live at `offset`, and no `&mut T` to the
    /// same location may be alive.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        self.check::<T>(offset);
        unsafe { &*(self.base.as_ptr().add(offset) as *const T) }
    }

    /// Exclusive reference to a `T` placed at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the location, which in practice
    /// means the region is being initialized and is not yet visible to peers.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        self.check::<T>(offset);
        unsafe { &mut *(self.base.as_ptr().add(offset) as *mut T) }
    }

    #[inline]
    fn check<T>(&self, offset: usize) {
        let fits = offset
            .checked_add(core::mem::size_of::<T>())
            .is_some_and(|end| end <= self.len);
        assert!(fits, "value at {offset} does not fit in region");
        assert!(
            (self.base.as_ptr() as usize + offset) % core::mem::align_of::<T>() == 0,
            "misaligned access at offset {offset}"
        );
    }
}

/// Heap-backed memory that owns its [`Region`]. Used by tests and loom models.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: core::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate `len` zeroed bytes aligned to 64.
    pub fn new_zeroed(len: usize) -> Self {
        let layout = core::alloc::Layout::from_size_align(len.max(64), 64).expect("valid layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    pub fn region(&self) -> Region {
        // SAFETY: the allocation is live for as long as `self` is.
        unsafe { Region::from_raw(self.ptr.as_ptr(), self.layout.size()) }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new_zeroed` with this exact layout.
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
