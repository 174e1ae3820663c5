//! Parallel loops over an integer range.
//!
//! `Static` splits the range into one contiguous block per worker with no
//! shared state. `Dynamic` and `Guided` hand out chunks from a cursor in the
//! control block: dynamic chunks have a fixed size, guided chunks shrink with
//! the remaining work but never below the minimum.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::group::Group;

/// How iterations are divided among workers. Guided when unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    Static,
    Dynamic,
    #[default]
    Guided,
}

impl Schedule {
    fn code(self) -> u32 {
        match self {
            Self::Static => 0,
            Self::Dynamic => 1,
            Self::Guided => 2,
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "guided" => Ok(Self::Guided),
            other => Err(Error::InvalidConfig(format!("unknown loop schedule {other:?}"))),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Guided => "guided",
        })
    }
}

fn span(range: &Range<i64>) -> u64 {
    if range.end > range.start {
        range.end.wrapping_sub(range.start) as u64
    } else {
        0
    }
}

fn offset(start: i64, n: u64) -> i64 {
    start.wrapping_add(n as i64)
}

impl Group {
    /// This worker's contiguous share of `range` under a static split.
    ///
    /// Blocks are `ceil(len / size)` long; trailing workers may get less or
    /// nothing.
    pub fn static_block(&self, range: Range<i64>) -> Range<i64> {
        let total = span(&range);
        let block = total.div_ceil(u64::from(self.size()));
        let lo = (block * u64::from(self.id())).min(total);
        let hi = (lo + block).min(total);
        offset(range.start, lo)..offset(range.start, hi)
    }

    /// Run `body` once for every value in `range`, split across the group.
    ///
    /// Every worker must call this with the same arguments. Returns after all
    /// workers have finished their share. `min_chunk` is the dynamic chunk
    /// size and the guided floor; it is ignored for static loops.
    pub fn par_for_each(
        &self,
        range: Range<i64>,
        schedule: Schedule,
        min_chunk: u64,
        mut body: impl FnMut(i64),
    ) -> Result<()> {
        tracing::debug!(
            id = self.id(),
            start = range.start,
            end = range.end,
            %schedule,
            "parallel loop"
        );
        if schedule == Schedule::Static {
            for i in self.static_block(range) {
                body(i);
            }
            return self.barrier();
        }

        let control = self.region().control();
        if self.is_master() {
            control.loop_policy.store(schedule.code(), Ordering::Relaxed);
            control.loop_start.store(range.start as u64, Ordering::Relaxed);
            control.loop_end.store(range.end as u64, Ordering::Relaxed);
            control.loop_next.store(0, Ordering::Relaxed);
            control.loop_min_chunk.store(min_chunk.max(1), Ordering::Relaxed);
        }
        self.barrier()?;

        let start = control.loop_start.load(Ordering::Relaxed) as i64;
        let end = control.loop_end.load(Ordering::Relaxed) as i64;
        let total = span(&(start..end));
        let min_chunk = control.loop_min_chunk.load(Ordering::Relaxed);
        let workers = u64::from(self.size());
        let mut chunks = 0u64;

        loop {
            let claimed = match schedule {
                Schedule::Dynamic => {
                    let lo = control.loop_next.fetch_add(min_chunk, Ordering::AcqRel);
                    (lo < total).then(|| lo..(lo + min_chunk).min(total))
                }
                _ => control
                    .loop_next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                        (next < total).then(|| {
                            let chunk = (total - next).div_ceil(workers).max(min_chunk);
                            (next + chunk).min(total)
                        })
                    })
                    .ok()
                    .map(|lo| {
                        let chunk = (total - lo).div_ceil(workers).max(min_chunk);
                        control.loop_chunk.store(chunk, Ordering::Relaxed);
                        lo..(lo + chunk).min(total)
                    }),
            };
            let Some(chunk) = claimed else { break };
            chunks += 1;
            for n in chunk {
                body(offset(start, n));
            }
        }
        tracing::trace!(id = self.id(), chunks, "parallel loop share done");
        self.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::region::Region;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU8;
    use std::time::Duration;

    fn group_region(label: &str, size: u32) -> Arc<Region> {
        let path =
            std::env::temp_dir().join(format!("test_sched_{}_{}.shm", label, std::process::id()));
        Arc::new(
            Region::create(
                &path,
                RegionConfig {
                    cells: 1,
                    group_size: size,
                    persist: false,
                    timeout: Some(Duration::from_secs(10)),
                    ..Default::default()
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_schedule_parse() {
        assert_eq!("Guided".parse::<Schedule>().unwrap(), Schedule::Guided);
        assert_eq!("dynamic".parse::<Schedule>().unwrap(), Schedule::Dynamic);
        assert!(matches!("fastest".parse::<Schedule>(), Err(Error::InvalidConfig(_))));
        assert_eq!(Schedule::Static.to_string(), "static");
        assert_eq!(Schedule::default(), Schedule::Guided);
    }

    #[test]
    fn test_static_blocks() {
        let region = group_region("static", 4);
        let blocks: Vec<_> = (0..4)
            .map(|id| Group::join(region.clone(), id).unwrap().static_block(0..1000))
            .collect();
        assert_eq!(blocks, vec![0..250, 250..500, 500..750, 750..1000]);

        let g3 = Group::join(region.clone(), 3).unwrap();
        assert_eq!(g3.static_block(0..10), 9..10);
        assert!(g3.static_block(0..2).is_empty());
        assert!(g3.static_block(5..5).is_empty());
        assert_eq!(Group::join(region, 0).unwrap().static_block(-4..4), -4..-2);
    }

    fn run_covering(schedule: Schedule, label: &str) {
        const WORKERS: u32 = 4;
        const LEN: usize = 1013;
        let region = group_region(label, WORKERS);
        let hits: Arc<Vec<AtomicU8>> = Arc::new((0..LEN).map(|_| AtomicU8::new(0)).collect());
        let handles: Vec<_> = (0..WORKERS)
            .map(|id| {
                let group = Group::join(region.clone(), id).unwrap();
                let hits = hits.clone();
                std::thread::spawn(move || {
                    for _ in 0..2 {
                        group
                            .par_for_each(-13..1000, schedule, 7, |i| {
                                hits[(i + 13) as usize].fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_static_loop_covers_range_once() {
        run_covering(Schedule::Static, "cover_static");
    }

    #[test]
    fn test_dynamic_loop_covers_range_once() {
        run_covering(Schedule::Dynamic, "cover_dynamic");
    }

    #[test]
    fn test_guided_loop_covers_range_once() {
        run_covering(Schedule::Guided, "cover_guided");
    }

    #[test]
    fn test_empty_range_still_synchronizes() {
        let region = group_region("empty", 1);
        let group = Group::join(region, 0).unwrap();
        let mut calls = 0;
        group
            .par_for_each(10..0, Schedule::Guided, 1, |_| calls += 1)
            .unwrap();
        assert_eq!(calls, 0);
    }
}
