//! Full/Empty tagged shared memory for cooperating processes.
//!
//! A [`Region`] is a file-backed mapping of tagged cells that any number of
//! threads or processes can attach to. Each cell holds one [`Value`] and a
//! Full/Empty tag, which gives you:
//!
//! - dataflow hand-off: [`Region::write_ef`] / [`Region::read_fe`]
//! - atomic updates: [`Region::faa`], [`Region::cas`]
//! - a readers/writer lock per cell: [`Region::read_rw`] / [`Region::release_rw`]
//! - multi-cell [`Transaction`]s acquired in a global order, so they cannot
//!   deadlock against each other
//! - a shared stack and queue built from cells
//! - optional key-addressed cells through an open-addressed map ([`Key`])
//!
//! Workers that share a region form a [`Group`], which adds barriers,
//! `single`/`master`/`critical` sections, and parallel loops with static,
//! dynamic, or guided scheduling ([`Schedule`]).
//!
//! Blocking operations retry with backoff until the handle's timeout
//! ([`Region::set_timeout`]) expires, then fail with [`Error::Timeout`].
//!
//! # Example
//!
//! ```no_run
//! use tagshm::{Region, RegionConfig, Value};
//!
//! # fn main() -> tagshm::Result<()> {
//! let region = Region::create("/dev/shm/counters", RegionConfig {
//!     cells: 4,
//!     fill: Some(Value::Int(0)),
//!     ..Default::default()
//! })?;
//! region.faa(0, 1i64)?;
//!
//! let peer = Region::attach("/dev/shm/counters")?;
//! assert_eq!(peer.read(0)?, Value::Int(1));
//! # Ok(())
//! # }
//! ```

mod cell;
mod config;
mod error;
mod group;
mod heap;
mod keymap;
mod layout;
mod mapping;
mod region;
mod rmw;
mod rwlock;
mod schedule;
mod stack;
mod txn;
mod value;
mod wait;

pub use cell::Tag;
pub use config::{DEFAULT_HEAP_SIZE, DEFAULT_TIMEOUT, RegionConfig};
pub use error::{Error, Result};
pub use group::{GROUP_SIZE_ENV, Group, WORKER_ID_ENV, WorkerIdentity};
pub use keymap::{Key, MAX_PROBES, MapKey};
pub use layout::{LayoutError, MAX_DIMS};
pub use region::Region;
pub use schedule::Schedule;
pub use txn::{Transaction, TxElement};
pub use value::{Value, ValueKind};
