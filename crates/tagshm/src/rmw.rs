//! Fetch-and-add and compare-and-swap.
//!
//! Both take the cell exclusively for the duration of the update but ignore
//! its Full/Empty state, so they never wait on a dataflow handoff.

use tagshm_primitives::Gate;

use crate::error::{Error, Result};
use crate::region::Region;
use crate::value::{Value, ValueKind};

impl Region {
    /// Add `delta` to the stored value and return the value before the update.
    ///
    /// See [`Value::add`] for how mixed kinds combine. Serialized composites
    /// are rejected with [`Error::TypeMismatch`].
    pub fn faa(&self, index: usize, delta: impl Into<Value>) -> Result<Value> {
        let delta = delta.into();
        let mut guard = self.lock_cell("faa", index, Gate::Any)?;
        let old = guard.load()?;
        let new = old
            .add(&delta)
            .map_err(|(stored, operand)| Error::TypeMismatch {
                op: "faa",
                stored,
                operand,
            })?;
        guard.store(&new)?;
        Ok(old)
    }

    /// Store `new` if the cell is identical to `expected`. Returns the value
    /// found in the cell, which equals `expected` exactly when the swap happened.
    ///
    /// Serialized composites are never compared: a composite in the cell,
    /// in `expected`, or in `new` fails with [`Error::TypeMismatch`].
    pub fn cas(&self, index: usize, expected: &Value, new: impl Into<Value>) -> Result<Value> {
        let new = new.into();
        let mut guard = self.lock_cell("cas", index, Gate::Any)?;
        let old = guard.load()?;
        if [old.kind(), expected.kind(), new.kind()]
            .into_iter()
            .any(ValueKind::is_composite)
        {
            return Err(Error::TypeMismatch {
                op: "cas",
                stored: old.kind(),
                operand: new.kind(),
            });
        }
        if old.identical(expected) {
            guard.store(&new)?;
        }
        Ok(old)
    }
}
