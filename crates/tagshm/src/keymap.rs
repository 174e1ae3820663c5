//! Addressing cells by coordinates or by mapped keys.
//!
//! A region created with `use_map` carries one map slot per cell. A key hashes
//! to a starting slot and probes linearly; the first free slot on the probe
//! path is claimed for a new key, and the claimed slot's index is the cell the
//! key owns. Keys are never removed, so probe paths never break.

use tagshm_primitives::Gate;

use crate::error::{Error, Result};
use crate::region::Region;
use crate::value::Value;

/// Longest probe sequence before a lookup gives up.
pub const MAX_PROBES: usize = 200;

/// A non-index key resolved through the key map.
#[derive(Debug, Clone, PartialEq)]
pub enum MapKey {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MapKey {
    fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(v) => Value::Int(*v),
            Self::Float(v) => Value::Float(*v),
            Self::Str(s) => Value::Str(s.clone()),
        }
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Int(v) => Some(Self::Int(v)),
            Value::Float(v) => Some(Self::Float(v)),
            Value::Str(s) => Some(Self::Str(s)),
            _ => None,
        }
    }

    /// FNV-1a over a kind byte and the key bytes; stable across processes.
    fn hash(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        };
        match self {
            Self::Bool(b) => feed(&[1, *b as u8]),
            Self::Int(v) => {
                feed(&[2]);
                feed(&v.to_le_bytes());
            }
            Self::Float(v) => {
                feed(&[3]);
                feed(&v.to_bits().to_le_bytes());
            }
            Self::Str(s) => {
                feed(&[4]);
                feed(s.as_bytes());
            }
        }
        hash
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for MapKey {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Any way of naming a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// Linear cell index.
    Index(usize),
    /// Coordinates in the region's dimensions.
    Coords(Vec<usize>),
    /// Key resolved through the key map.
    Mapped(MapKey),
}

impl From<MapKey> for Key {
    fn from(key: MapKey) -> Self {
        Self::Mapped(key)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Mapped(s.into())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Mapped(s.into())
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Self::Mapped(MapKey::Bool(b))
    }
}

impl From<&[usize]> for Key {
    fn from(coords: &[usize]) -> Self {
        Self::Coords(coords.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Key {
    fn from(coords: [usize; N]) -> Self {
        Self::Coords(coords.to_vec())
    }
}

impl Region {
    /// Linear index of a coordinate tuple: `sum(coord[d] * stride[d])`.
    pub fn linear_index(&self, coords: &[usize]) -> Result<usize> {
        let dims = self.dims();
        if dims.is_empty() {
            return match coords {
                [index] => self.slot(*index).map(|_| *index),
                _ => Err(Error::InvalidCoordinates(format!(
                    "region is one-dimensional, got {} coordinates",
                    coords.len()
                ))),
            };
        }
        if coords.len() != dims.len() {
            return Err(Error::InvalidCoordinates(format!(
                "expected {} coordinates, got {}",
                dims.len(),
                coords.len()
            )));
        }
        let mut linear = 0usize;
        for ((coord, dim), stride) in coords.iter().zip(dims).zip(self.strides()) {
            if coord >= dim {
                return Err(Error::InvalidCoordinates(format!(
                    "coordinate {} outside dimension of {}",
                    coord, dim
                )));
            }
            linear += coord * stride;
        }
        Ok(linear)
    }

    /// Index of a mapped key that has already been written.
    pub fn index_of(&self, key: &MapKey) -> Result<usize> {
        self.probe(key, false)
    }

    /// Index of a mapped key, claiming a free slot on first use.
    pub fn index_of_or_insert(&self, key: &MapKey) -> Result<usize> {
        self.probe(key, true)
    }

    /// The mapped key that owns `index`, if any.
    pub fn index_to_key(&self, index: usize) -> Result<Option<MapKey>> {
        let slot = self.map_slot(index)?;
        let guard = self.lock_slot("index_to_key", slot, index, Gate::Any)?;
        Ok(MapKey::from_value(guard.load()?))
    }

    fn probe(&self, key: &MapKey, insert: bool) -> Result<usize> {
        if !self.has_map() {
            return Err(Error::MapDisabled);
        }
        let len = self.len();
        let start = (key.hash() % len as u64) as usize;
        let wanted = key.to_value();

        for step in 0..MAX_PROBES.min(len) {
            let index = (start + step) % len;
            let slot = self.map_slot(index)?;
            let mut guard = self.lock_slot("map_probe", slot, index, Gate::Any)?;
            match guard.load()? {
                Value::Undefined if insert => {
                    guard.store(&wanted)?;
                    tracing::trace!(?key, index, "mapped new key");
                    return Ok(index);
                }
                Value::Undefined => return Err(Error::KeyNotFound),
                stored if stored.identical(&wanted) => return Ok(index),
                _ => {}
            }
        }
        Err(if insert {
            Error::MapFull
        } else {
            Error::KeyNotFound
        })
    }

    /// Resolve any key to a cell index. Mapped keys are claimed when
    /// `insert` is set.
    pub fn resolve(&self, key: &Key, insert: bool) -> Result<usize> {
        match key {
            Key::Index(index) => self.slot(*index).map(|_| *index),
            Key::Coords(coords) => self.linear_index(coords),
            Key::Mapped(key) if insert => self.index_of_or_insert(key),
            Key::Mapped(key) => self.index_of(key),
        }
    }

    /// Read the cell named by `key` without synchronizing on its tag.
    pub fn get(&self, key: impl Into<Key>) -> Result<Value> {
        let index = self.resolve(&key.into(), false)?;
        self.read(index)
    }

    /// Write the cell named by `key`, claiming a map slot for new keys.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let index = self.resolve(&key.into(), true)?;
        self.write(index, value)
    }
}
