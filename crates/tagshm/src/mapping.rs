//! Shared file mappings.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tagshm_primitives::Region as RawRegion;

/// A `MAP_SHARED` mapping of a whole file.
pub(crate) struct Mapping {
    /// Base address of the mapping.
    base_addr: *mut u8,
    /// Size of the mapping.
    size: usize,
    /// The underlying file (kept open).
    _file: File,
}

// SAFETY: Mapping is Send + Sync because the memory is synchronized via atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create (or truncate) the file at `path`, size it, and map it.
    pub fn create(path: &Path, size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        Self::map(file, size)
    }

    /// Map an existing file at its current length.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "region file is empty",
            ));
        }
        Self::map(file, size)
    }

    fn map(file: File, size: usize) -> io::Result<Self> {
        // SAFETY: fresh mapping of an open file descriptor; checked below.
        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if base_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            base_addr: base_addr as *mut u8,
            size,
            _file: file,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    /// Raw view of the mapped bytes. Valid while `self` is alive.
    pub fn region(&self) -> RawRegion {
        // SAFETY: mmap returns page-aligned memory valid for `size` bytes.
        unsafe { RawRegion::from_raw(self.base_addr, self.size) }
    }

    /// Flush dirty pages to the backing file.
    pub fn sync(&self) -> io::Result<()> {
        // SAFETY: base_addr and size describe a live mapping.
        let rc = unsafe {
            libc::msync(
                self.base_addr as *mut libc::c_void,
                self.size,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Pin the mapping in RAM.
    pub fn lock_in_memory(&self) -> io::Result<()> {
        // SAFETY: base_addr and size describe a live mapping.
        let rc = unsafe { libc::mlock(self.base_addr as *const libc::c_void, self.size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base_addr and size were valid when created.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}
