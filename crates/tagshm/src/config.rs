//! Region configuration.

use std::time::Duration;

use crate::cell::Tag;
use crate::error::{Error, Result};
use crate::layout::{Geometry, MAX_DIMS};
use crate::value::Value;

/// Default heap capacity for variable-length payloads.
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

/// Default bound on any single blocking wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for creating a region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Number of cells. May be left at 0 when `dims` is given.
    pub cells: usize,
    /// Extent of each dimension for coordinate indexing (empty = linear only).
    pub dims: Vec<usize>,
    /// Heap capacity in bytes for strings and serialized values.
    pub heap_size: usize,
    /// Allocate a key map so cells can be addressed by string, number, or boolean keys.
    pub use_map: bool,
    /// Number of workers that will coordinate through this region.
    pub group_size: u32,
    /// Value written to every cell at creation.
    pub fill: Option<Value>,
    /// Tag every cell starts with.
    pub initial_tag: Tag,
    /// Keep the backing file after the creating handle is dropped.
    pub persist: bool,
    /// Pin the mapping in RAM (failure is logged, not fatal).
    pub lock_memory: bool,
    /// Bound on blocking waits made through the created handle (`None` = wait forever).
    pub timeout: Option<Duration>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            cells: 0,
            dims: Vec::new(),
            heap_size: DEFAULT_HEAP_SIZE,
            use_map: false,
            group_size: 1,
            fill: None,
            initial_tag: Tag::Full,
            persist: true,
            lock_memory: false,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl RegionConfig {
    /// Resolve the cell count and check the shape.
    pub(crate) fn geometry(&self) -> Result<Geometry> {
        if self.group_size == 0 {
            return Err(Error::InvalidConfig("group size must be at least 1".into()));
        }
        if self.dims.len() > MAX_DIMS {
            return Err(Error::InvalidConfig(format!(
                "{} dimensions given, at most {} supported",
                self.dims.len(),
                MAX_DIMS
            )));
        }
        if self.dims.contains(&0) {
            return Err(Error::InvalidConfig("dimensions must be non-zero".into()));
        }

        let cells = if self.dims.is_empty() {
            self.cells
        } else {
            let product = self
                .dims
                .iter()
                .try_fold(1usize, |acc, d| acc.checked_mul(*d))
                .ok_or_else(|| Error::InvalidConfig("dimension product overflows".into()))?;
            if self.cells != 0 && self.cells != product {
                return Err(Error::InvalidConfig(format!(
                    "cells = {} disagrees with dimensions {:?}",
                    self.cells, self.dims
                )));
            }
            product
        };
        if cells == 0 {
            return Err(Error::InvalidConfig("cell count must be non-zero".into()));
        }

        Ok(Geometry {
            cells,
            dims: self.dims.clone(),
            group_size: self.group_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cells_from_dims() {
        let config = RegionConfig {
            dims: vec![3, 4],
            ..Default::default()
        };
        assert_eq!(config.geometry().unwrap().cells, 12);
    }

    #[test]
    fn test_missing_group_size_rejected() {
        let config = RegionConfig {
            cells: 4,
            group_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.geometry(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_conflicting_shape_rejected() {
        let config = RegionConfig {
            cells: 5,
            dims: vec![2, 2],
            ..Default::default()
        };
        assert!(matches!(config.geometry(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_cells_rejected() {
        assert!(RegionConfig::default().geometry().is_err());
    }
}
