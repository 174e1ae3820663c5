//! Bounded waiting for blocking operations.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Polls spent spinning before the first sleep.
const SPIN_LIMIT: u32 = 64;
const FIRST_SLEEP: Duration = Duration::from_micros(1);
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Spin briefly, then sleep with exponential growth up to 1ms.
pub(crate) struct Backoff {
    spins: u32,
    sleep: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            spins: 0,
            sleep: FIRST_SLEEP,
        }
    }

    pub fn snooze(&mut self) {
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(MAX_SLEEP);
        }
    }
}

/// Retry `attempt` until it yields a value or `limit` elapses.
///
/// `None` as the limit waits forever. On expiry the error names the
/// operation and cell so a stalled participant can be identified.
pub(crate) fn wait_for<T>(
    op: &'static str,
    index: Option<usize>,
    limit: Option<Duration>,
    mut attempt: impl FnMut() -> Option<T>,
) -> Result<T> {
    if let Some(value) = attempt() {
        return Ok(value);
    }
    let started = Instant::now();
    let mut backoff = Backoff::new();
    loop {
        backoff.snooze();
        if let Some(value) = attempt() {
            return Ok(value);
        }
        let waited = started.elapsed();
        if limit.is_some_and(|limit| waited >= limit) {
            tracing::warn!(op, ?index, ?waited, "blocking wait timed out");
            return Err(Error::Timeout { op, index, waited });
        }
    }
}
