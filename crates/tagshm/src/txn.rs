//! Deadlock-free multi-cell transactions.
//!
//! A transaction locks every cell it names in one global order: by region
//! name, then by index. Read-only cells take a shared hold (`read_rw`);
//! read-write cells are drained with `read_fe`, which leaves them Empty and
//! blocks every other acquirer until the transaction ends. Because all
//! participants acquire in the same order, no cycle of waiters can form.

use std::sync::Arc;

use crate::cell::Tag;
use crate::error::{Error, Result};
use crate::region::Region;
use crate::value::Value;

/// One cell requested by a transaction.
#[derive(Debug, Clone)]
pub struct TxElement {
    pub region: Arc<Region>,
    pub index: usize,
    pub read_only: bool,
}

impl TxElement {
    pub fn read_write(region: &Arc<Region>, index: usize) -> Self {
        Self {
            region: region.clone(),
            index,
            read_only: false,
        }
    }

    pub fn read_only(region: &Arc<Region>, index: usize) -> Self {
        Self {
            region: region.clone(),
            index,
            read_only: true,
        }
    }
}

struct Held {
    element: TxElement,
    original: Value,
}

/// Locks held by an open transaction.
///
/// End it with [`commit`](Self::commit) or [`abort`](Self::abort). Dropping an
/// open transaction aborts it.
pub struct Transaction {
    held: Vec<Held>,
    open: bool,
}

impl Transaction {
    /// Acquire every element in global order.
    ///
    /// If any acquisition fails (typically a timeout), everything acquired so
    /// far is restored and released before the error is returned.
    pub fn begin(elements: impl IntoIterator<Item = TxElement>) -> Result<Self> {
        let mut elements: Vec<TxElement> = elements.into_iter().collect();
        elements.sort_by(|a, b| {
            (a.region.name(), a.index).cmp(&(b.region.name(), b.index))
        });
        if let Some(pair) = elements.windows(2).find(|pair| {
            pair[0].region.name() == pair[1].region.name() && pair[0].index == pair[1].index
        }) {
            return Err(Error::DuplicateElement {
                region: pair[0].region.name().to_owned(),
                index: pair[0].index,
            });
        }

        let mut tx = Self {
            held: Vec::with_capacity(elements.len()),
            open: true,
        };
        for element in elements {
            let acquired = if element.read_only {
                element.region.read_rw(element.index)
            } else {
                element.region.read_fe(element.index)
            };
            match acquired {
                Ok(original) => tx.held.push(Held { element, original }),
                Err(e) => {
                    tracing::debug!(
                        region = %element.region.name(),
                        index = element.index,
                        error = %e,
                        "transaction acquisition failed, rolling back"
                    );
                    // Drop rolls back what we hold.
                    return Err(e);
                }
            }
        }
        tracing::debug!(cells = tx.held.len(), "transaction started");
        Ok(tx)
    }

    /// Value a cell held when the transaction acquired it.
    pub fn original(&self, region: &Region, index: usize) -> Option<&Value> {
        self.held
            .iter()
            .find(|h| h.element.region.name() == region.name() && h.element.index == index)
            .map(|h| &h.original)
    }

    /// Keep the values now in the read-write cells and release everything.
    pub fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    /// Restore every read-write cell and release everything.
    pub fn abort(mut self) -> Result<()> {
        self.finish(false)
    }

    /// Commit or abort.
    pub fn end(mut self, commit: bool) -> Result<()> {
        self.finish(commit)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        self.open = false;
        let mut first_error = None;
        for held in self.held.drain(..) {
            let Held { element, original } = held;
            let released = if element.read_only {
                element.region.release_rw(element.index)
            } else if commit {
                element.region.set_tag(element.index, Tag::Full)
            } else {
                element.region.write_xf(element.index, original)
            };
            if let Err(e) = released {
                tracing::warn!(
                    region = %element.region.name(),
                    index = element.index,
                    error = %e,
                    "failed to release transaction cell"
                );
                first_error.get_or_insert(e);
            }
        }
        tracing::debug!(commit, "transaction ended");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            let _ = self.finish(false);
        }
    }
}
