//! Worker groups: identity, barrier, single, master, and critical sections.
//!
//! Every worker in a group maps the same region and calls the collective
//! operations in the same order. State lives in the region's control block,
//! so workers may be threads of one process or separate processes.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::region::Region;
use crate::wait::wait_for;

/// Environment variable carrying the group size for spawned workers.
pub const GROUP_SIZE_ENV: &str = "TAGSHM_GROUP_SIZE";
/// Environment variable carrying this worker's id.
pub const WORKER_ID_ENV: &str = "TAGSHM_WORKER_ID";

/// A worker's place in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub id: u32,
    pub group_size: u32,
}

impl WorkerIdentity {
    pub fn new(id: u32, group_size: u32) -> Result<Self> {
        if group_size == 0 || id >= group_size {
            return Err(Error::InvalidWorker { id, group_size });
        }
        Ok(Self { id, group_size })
    }

    /// Read the identity a launcher passed through the environment.
    ///
    /// A process started without the variables is worker 0 of a group of 1.
    pub fn from_env() -> Result<Self> {
        let group_size = env_u32(GROUP_SIZE_ENV)?.unwrap_or(1);
        let id = env_u32(WORKER_ID_ENV)?.unwrap_or(0);
        Self::new(id, group_size)
    }
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{name}={raw:?} is not a worker count"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(Error::InvalidConfig(format!("{name} is not valid UTF-8")))
        }
    }
}

/// One worker's handle on a group's shared control state.
#[derive(Debug, Clone)]
pub struct Group {
    region: Arc<Region>,
    id: u32,
    size: u32,
}

impl Group {
    /// Join the group described by `region` as worker `id`.
    pub fn join(region: Arc<Region>, id: u32) -> Result<Self> {
        let size = region.group_size();
        let identity = WorkerIdentity::new(id, size)?;
        tracing::debug!(region = %region.name(), id, size, "joined worker group");
        Ok(Self {
            region,
            id: identity.id,
            size: identity.group_size,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_master(&self) -> bool {
        self.id == 0
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Block until every worker in the group has arrived.
    pub fn barrier(&self) -> Result<()> {
        let control = self.region.control();
        let generation = control.barrier_generation.load(Ordering::Acquire);
        let arrived = control.barrier_arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.size {
            control.barrier_arrived.store(0, Ordering::Relaxed);
            control.barrier_generation.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(id = self.id, generation, "barrier released");
            return Ok(());
        }
        wait_for("barrier", None, self.region.timeout(), || {
            (control.barrier_generation.load(Ordering::Acquire) != generation).then_some(())
        })
    }

    /// Run `f` on the first worker to arrive; everyone leaves together.
    ///
    /// Returns `Some` on the worker that ran `f`.
    pub fn single<R>(&self, f: impl FnOnce() -> R) -> Result<Option<R>> {
        let control = self.region.control();
        let arrived = control.single_arrived.fetch_add(1, Ordering::AcqRel) + 1;
        let result = (arrived == 1).then(f);
        if arrived == self.size {
            control.single_arrived.store(0, Ordering::Relaxed);
        }
        self.barrier()?;
        Ok(result)
    }

    /// Run `f` on worker 0 only. No synchronization is implied.
    pub fn master<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        self.is_master().then(f)
    }

    /// Run `f` while holding the group-wide mutual exclusion lock.
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let owner = self.id + 1;
        let control = self.region.control();
        wait_for("critical", None, self.region.timeout(), || {
            control
                .critical_owner
                .compare_exchange(0, owner, Ordering::Acquire, Ordering::Relaxed)
                .ok()
        })?;
        let guard = CriticalGuard {
            group: self,
            released: false,
        };
        let result = f();
        guard.release()?;
        Ok(result)
    }
}

/// Releases the critical section even if the body unwinds.
struct CriticalGuard<'g> {
    group: &'g Group,
    released: bool,
}

impl CriticalGuard<'_> {
    fn release(mut self) -> Result<()> {
        self.released = true;
        self.unlock()
    }

    fn unlock(&self) -> Result<()> {
        let owner = self.group.id + 1;
        self.group
            .region
            .control()
            .critical_owner
            .compare_exchange(owner, 0, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|found| {
                tracing::error!(id = self.group.id, found, "critical section owner changed while held");
                Error::LockLost
            })
    }
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.unlock();
        }
    }
}
