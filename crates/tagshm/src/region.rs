//! Region lifecycle: create, attach, destroy.
//!
//! - [`Region::create`]: called by exactly one process to lay out a fresh region
//! - [`Region::attach`]: used by every other participant to map the existing one

use std::io;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tagshm_primitives::{BuddyHeap, CellSlot, Fe, Region as RawRegion};

use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::layout::{ControlBlock, LayoutError, RegionHeader, RegionOffsets};
use crate::mapping::Mapping;
use crate::value::ValueKind;
use crate::wait::wait_for;

const NO_TIMEOUT: u64 = u64::MAX;

/// A mapped region of tagged cells.
///
/// Every handle (creator or attacher) has the same capabilities. Handles are
/// `Send + Sync`; share one between threads with an `Arc`.
pub struct Region {
    /// The memory mapping.
    mapping: Mapping,
    /// Raw view of the mapping.
    raw: RawRegion,
    /// Offset of the cell array.
    cells_offset: usize,
    /// Offset of the key map, if any.
    map_offset: Option<usize>,
    /// Payload heap.
    pub(crate) heap: BuddyHeap,
    cell_count: usize,
    dims: Vec<usize>,
    strides: Vec<usize>,
    group_size: u32,
    /// Path to the backing file.
    path: PathBuf,
    /// Canonical name, identical in every process that maps this file.
    name: String,
    /// Blocking bound for this handle, in nanoseconds.
    timeout_nanos: AtomicU64,
    /// Remove the backing file when this handle drops.
    unlink_on_drop: bool,
}

impl Region {
    /// Create a new region at the given path, replacing any existing file.
    pub fn create(path: impl AsRef<Path>, config: RegionConfig) -> Result<Self> {
        let path = path.as_ref();
        let geometry = config.geometry()?;
        let offsets = RegionOffsets::calculate(geometry.cells, config.use_map, config.heap_size)?;

        let mapping = Mapping::create(path, offsets.total_size)?;
        let raw = mapping.region();

        // Nothing else can see the region until `ready` is published.
        let header = unsafe { raw.get_mut::<RegionHeader>(0) };
        header.init(&geometry, &offsets);
        unsafe { raw.get_mut::<ControlBlock>(offsets.control) }.init();

        let fe = Fe::from(config.initial_tag);
        for i in 0..geometry.cells {
            let slot = unsafe { raw.get_mut::<CellSlot>(offsets.cells + i * size_of::<CellSlot>()) };
            slot.init(fe, ValueKind::Undefined.code(), 0);
        }
        if let Some(map) = offsets.map {
            for i in 0..geometry.cells {
                let slot = unsafe { raw.get_mut::<CellSlot>(map + i * size_of::<CellSlot>()) };
                slot.init(Fe::Full, ValueKind::Undefined.code(), 0);
            }
        }

        let heap = unsafe { BuddyHeap::init(raw, offsets.heap, offsets.heap_layout)? };

        let region = Self::assemble(
            mapping,
            heap,
            path,
            offsets.cells,
            offsets.map,
            geometry.cells,
            geometry.dims,
            geometry.group_size,
            config.timeout,
            !config.persist,
        )?;

        if let Some(fill) = &config.fill {
            for i in 0..region.cell_count {
                region.write(i, fill)?;
            }
        }
        if config.lock_memory {
            region.try_lock_memory();
        }

        region.header().ready.store(1, Ordering::Release);
        tracing::debug!(
            name = %region.name,
            cells = region.cell_count,
            heap_bytes = region.heap.capacity(),
            use_map = config.use_map,
            group_size = region.group_size,
            "created region"
        );
        Ok(region)
    }

    /// Attach to an existing region.
    ///
    /// Fails with [`Error::RegionNotFound`] if nothing exists at `path`, and
    /// with [`LayoutError::NotReady`] if the creator has not finished yet.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mapping = match Mapping::open(path) {
            Ok(mapping) => mapping,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::RegionNotFound(path.to_path_buf()));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(LayoutError::NotReady.into());
            }
            Err(e) => return Err(e.into()),
        };
        if mapping.len() < size_of::<RegionHeader>() {
            return Err(LayoutError::NotReady.into());
        }

        let raw = mapping.region();
        let header = unsafe { raw.get::<RegionHeader>(0) };
        if header.ready.load(Ordering::Acquire) == 0 {
            return Err(LayoutError::NotReady.into());
        }
        header.validate(mapping.len())?;

        let cell_count = header.cell_count as usize;
        let cells_offset = header.cells_offset as usize;
        let map_offset = header.has_map().then_some(header.map_offset as usize);
        let cell_bytes = cell_count
            .checked_mul(size_of::<CellSlot>())
            .ok_or(LayoutError::Overflow)?;
        for section in std::iter::once(cells_offset).chain(map_offset) {
            let fits = section
                .checked_add(cell_bytes)
                .is_some_and(|end| end <= mapping.len());
            if !fits {
                return Err(LayoutError::RegionTooSmall {
                    required: section.saturating_add(cell_bytes),
                    found: mapping.len(),
                }
                .into());
            }
        }

        let heap = unsafe { BuddyHeap::attach(raw, header.heap_offset as usize)? };
        let dims = header.dims();
        let group_size = header.group_size;

        let region = Self::assemble(
            mapping,
            heap,
            path,
            cells_offset,
            map_offset,
            cell_count,
            dims,
            group_size,
            Some(crate::config::DEFAULT_TIMEOUT),
            false,
        )?;
        tracing::debug!(name = %region.name, cells = cell_count, "attached region");
        Ok(region)
    }

    /// Attach, waiting for the region to be created and published.
    pub fn attach_wait(path: impl AsRef<Path>, timeout: Option<Duration>) -> Result<Self> {
        let path = path.as_ref();
        wait_for("attach", None, timeout, || match Self::attach(path) {
            Err(Error::RegionNotFound(_)) | Err(Error::Layout(LayoutError::NotReady)) => None,
            other => Some(other),
        })?
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        mapping: Mapping,
        heap: BuddyHeap,
        path: &Path,
        cells_offset: usize,
        map_offset: Option<usize>,
        cell_count: usize,
        dims: Vec<usize>,
        group_size: u32,
        timeout: Option<Duration>,
        unlink_on_drop: bool,
    ) -> Result<Self> {
        let name = std::fs::canonicalize(path)?.display().to_string();
        let strides = dims
            .iter()
            .scan(1usize, |stride, dim| {
                let this = *stride;
                *stride = stride.saturating_mul(*dim);
                Some(this)
            })
            .collect();
        let raw = mapping.region();
        Ok(Self {
            mapping,
            raw,
            cells_offset,
            map_offset,
            heap,
            cell_count,
            dims,
            strides,
            group_size,
            path: path.to_path_buf(),
            name,
            timeout_nanos: AtomicU64::new(encode_timeout(timeout)),
            unlink_on_drop,
        })
    }

    /// Detach from the region, optionally removing its backing file.
    ///
    /// Other processes that still have it mapped keep working on their
    /// mapping; new attaches fail once the file is unlinked.
    pub fn destroy(mut self, unlink: bool) -> Result<()> {
        let path = std::mem::take(&mut self.path);
        self.unlink_on_drop = false;
        drop(self);
        if unlink {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(path = %path.display(), unlink, "destroyed region");
        Ok(())
    }

    /// Flush the mapping to its backing file.
    pub fn sync(&self) -> Result<()> {
        self.mapping.sync().map_err(Error::Io)
    }

    fn try_lock_memory(&self) {
        if let Err(error) = self.mapping.lock_in_memory() {
            tracing::warn!(name = %self.name, %error, "could not lock region in memory");
        }
    }

    /// Number of cells.
    #[inline]
    pub fn len(&self) -> usize {
        self.cell_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    /// Canonical path of the backing file; orders cells across regions.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub(crate) fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn has_map(&self) -> bool {
        self.map_offset.is_some()
    }

    /// Bound applied to blocking waits made through this handle.
    pub fn timeout(&self) -> Option<Duration> {
        decode_timeout(self.timeout_nanos.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout_nanos
            .store(encode_timeout(timeout), Ordering::Relaxed);
    }

    pub(crate) fn header(&self) -> &RegionHeader {
        unsafe { self.raw.get::<RegionHeader>(0) }
    }

    pub(crate) fn control(&self) -> &ControlBlock {
        unsafe { self.raw.get::<ControlBlock>(size_of::<RegionHeader>()) }
    }

    /// The cell at `index`, bounds checked.
    pub(crate) fn slot(&self, index: usize) -> Result<&CellSlot> {
        if index >= self.cell_count {
            return Err(Error::IndexOutOfBounds {
                index,
                len: self.cell_count,
            });
        }
        Ok(unsafe {
            self.raw
                .get::<CellSlot>(self.cells_offset + index * size_of::<CellSlot>())
        })
    }

    /// The key-map slot at `index`, or `MapDisabled`.
    pub(crate) fn map_slot(&self, index: usize) -> Result<&CellSlot> {
        let map = self.map_offset.ok_or(Error::MapDisabled)?;
        if index >= self.cell_count {
            return Err(Error::IndexOutOfBounds {
                index,
                len: self.cell_count,
            });
        }
        Ok(unsafe { self.raw.get::<CellSlot>(map + index * size_of::<CellSlot>()) })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            std::fs::remove_file(&self.path).ok();
            tracing::debug!(path = %self.path.display(), "removed non-persistent region");
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("cells", &self.cell_count)
            .field("dims", &self.dims)
            .field("group_size", &self.group_size)
            .field("has_map", &self.has_map())
            .finish()
    }
}

fn encode_timeout(timeout: Option<Duration>) -> u64 {
    timeout.map_or(NO_TIMEOUT, |t| t.as_nanos().min(NO_TIMEOUT as u128 - 1) as u64)
}

fn decode_timeout(nanos: u64) -> Option<Duration> {
    (nanos != NO_TIMEOUT).then(|| Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Tag;
    use crate::value::Value;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_path(label: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("test_region_{}_{}_{}.shm", label, std::process::id(), n))
    }

    #[test]
    fn test_region_create_and_attach() {
        let path = temp_path("attach");

        let host = Region::create(
            &path,
            RegionConfig {
                cells: 8,
                group_size: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(&host.header().magic, b"TAGSHM\0\0");
        assert_eq!(host.len(), 8);

        let peer = Region::attach(&path).unwrap();
        assert_eq!(peer.len(), 8);
        assert_eq!(peer.group_size(), 2);
        assert_eq!(peer.name(), host.name());

        host.write(3, 99i64).unwrap();
        assert_eq!(peer.read(3).unwrap(), Value::Int(99));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_attach_missing_region_is_reported() {
        let path = temp_path("missing");
        match Region::attach(&path) {
            Err(Error::RegionNotFound(p)) => assert_eq!(p, path),
            other => panic!("expected RegionNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_attach_rejects_foreign_file() {
        let path = temp_path("foreign");
        std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();
        assert!(matches!(Region::attach(&path), Err(Error::Layout(_))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_attach_wait_times_out() {
        let path = temp_path("never");
        let err = Region::attach_wait(&path, Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_fill_and_initial_tag() {
        let path = temp_path("fill");
        let region = Region::create(
            &path,
            RegionConfig {
                cells: 4,
                fill: Some(Value::from("init")),
                initial_tag: Tag::Empty,
                persist: false,
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..4 {
            assert_eq!(region.tag(i).unwrap(), Tag::Empty);
            assert_eq!(region.read(i).unwrap(), Value::from("init"));
        }
        drop(region);
        assert!(!path.exists());
    }

    #[test]
    fn test_destroy_with_unlink() {
        let path = temp_path("destroy");
        let region = Region::create(
            &path,
            RegionConfig {
                cells: 1,
                ..Default::default()
            },
        )
        .unwrap();
        region.sync().unwrap();
        region.destroy(true).unwrap();
        assert!(!path.exists());
        assert!(matches!(Region::attach(&path), Err(Error::RegionNotFound(_))));
    }

    #[test]
    fn test_persistent_region_outlives_handle() {
        let path = temp_path("persist");
        let region = Region::create(
            &path,
            RegionConfig {
                cells: 2,
                ..Default::default()
            },
        )
        .unwrap();
        region.write(1, true).unwrap();
        region.destroy(false).unwrap();

        let again = Region::attach(&path).unwrap();
        assert_eq!(again.read(1).unwrap(), Value::Bool(true));
        again.destroy(true).unwrap();
    }

    #[test]
    fn test_timeout_setting() {
        let path = temp_path("timeout");
        let region = Region::create(
            &path,
            RegionConfig {
                cells: 1,
                timeout: None,
                persist: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(region.timeout(), None);
        region.set_timeout(Some(Duration::from_millis(5)));
        assert_eq!(region.timeout(), Some(Duration::from_millis(5)));
    }
}
