//! # Operation Profiler
//!
//! Lightweight timing instrumentation threaded through the page store
//! operations as an optional `&Profiler` argument. Each named step keeps a
//! call count and the cumulative nanoseconds spent inside it.
//!
//! ## Usage
//!
//! ```ignore
//! let profiler = Profiler::new();
//!
//! let page = store.retrieve(42, Some(&profiler))?;
//! store.commit(7, Some(&profiler))?;
//!
//! println!("{}", profiler.report());
//! ```
//!
//! Steps are recorded through an RAII [`ProfilerStep`] guard so that a step
//! that returns early through `?` is still accounted for:
//!
//! ```ignore
//! let _step = Profiler::step(profiler, "commit.write");
//! page.write(out, commit_id)?;
//! ```
//!
//! ## Thread Safety
//!
//! Counters are `AtomicU64` with `Relaxed` ordering, stored in a map guarded
//! by a `parking_lot::RwLock`. The write lock is only taken the first time a
//! step name is seen, so concurrent readers of the same store profile without
//! contention in the steady state.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct StepCounters {
    count: AtomicU64,
    total_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepStats {
    pub count: u64,
    pub total_ns: u64,
}

impl StepStats {
    pub fn average_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }
}

#[derive(Debug, Default)]
pub struct Profiler {
    steps: RwLock<HashMap<&'static str, StepCounters>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing `name` on an optional profiler.
    ///
    /// Returns a guard that records the elapsed time when dropped. With no
    /// profiler the guard does nothing.
    pub fn step<'a>(profiler: Option<&'a Profiler>, name: &'static str) -> ProfilerStep<'a> {
        ProfilerStep {
            profiler,
            name,
            start: Instant::now(),
        }
    }

    pub fn record(&self, name: &'static str, elapsed_ns: u64) {
        {
            let steps = self.steps.read();
            if let Some(counters) = steps.get(name) {
                counters.count.fetch_add(1, Ordering::Relaxed);
                counters.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
                return;
            }
        }

        let mut steps = self.steps.write();
        let counters = steps.entry(name).or_default();
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    pub fn stats(&self, name: &str) -> Option<StepStats> {
        self.steps.read().get(name).map(|c| StepStats {
            count: c.count.load(Ordering::Relaxed),
            total_ns: c.total_ns.load(Ordering::Relaxed),
        })
    }

    pub fn reset(&self) {
        self.steps.write().clear();
    }

    /// Renders all steps sorted by name, one per line.
    pub fn report(&self) -> String {
        let steps = self.steps.read();
        let mut names: Vec<_> = steps.keys().copied().collect();
        names.sort_unstable();

        let mut out = String::new();
        for name in names {
            let c = &steps[name];
            let count = c.count.load(Ordering::Relaxed);
            let total_ns = c.total_ns.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{:<20} count={:<8} total={}us",
                name,
                count,
                total_ns / 1_000
            );
        }
        out
    }
}

pub struct ProfilerStep<'a> {
    profiler: Option<&'a Profiler>,
    name: &'static str,
    start: Instant,
}

impl Drop for ProfilerStep<'_> {
    fn drop(&mut self) {
        if let Some(profiler) = self.profiler {
            let elapsed = self.start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
            profiler.record(self.name, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_guard_records_on_drop() {
        let profiler = Profiler::new();
        {
            let _step = Profiler::step(Some(&profiler), "commit");
        }
        {
            let _step = Profiler::step(Some(&profiler), "commit");
        }

        let stats = profiler.stats("commit").unwrap();
        assert_eq!(stats.count, 2);
        assert!(profiler.stats("retrieve").is_none());
    }

    #[test]
    fn step_without_profiler_is_noop() {
        let _step = Profiler::step(None, "retrieve");
    }

    #[test]
    fn report_is_sorted_by_name() {
        let profiler = Profiler::new();
        profiler.record("retrieve", 2_000);
        profiler.record("commit", 5_000);

        let report = profiler.report();
        let commit_at = report.find("commit").unwrap();
        let retrieve_at = report.find("retrieve").unwrap();
        assert!(commit_at < retrieve_at);

        profiler.reset();
        assert!(profiler.report().is_empty());
    }

    #[test]
    fn average_of_empty_step_is_zero() {
        let stats = StepStats {
            count: 0,
            total_ns: 0,
        };
        assert_eq!(stats.average_ns(), 0);
    }
}
