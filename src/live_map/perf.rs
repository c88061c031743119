//! Timing counters for the live map's hot paths.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

pub const OP_MERGE: &str = "merge";
pub const OP_WORKSTATION_RELOAD: &str = "workstation_reload";
pub const OP_SCENE_BUILD: &str = "scene_build";

/// Aggregated timings for one operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfMetrics {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl PerfMetrics {
    /// Mean duration in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1_000.0 / self.count as f64
    }
}

#[derive(Debug, Default)]
pub struct PerfStats {
    ops: Mutex<BTreeMap<&'static str, PerfMetrics>>,
}

impl PerfStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: &'static str, elapsed: Duration) {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = ops.entry(op).or_default();
        entry.count += 1;
        entry.total += elapsed;
        entry.max = entry.max.max(elapsed);
    }

    /// Run `f`, recording its wall time under `op`.
    pub fn time<T>(&self, op: &'static str, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = f();
        self.record(op, started.elapsed());
        out
    }

    #[must_use]
    pub fn get(&self, op: &str) -> Option<PerfMetrics> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).get(op).copied()
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<&'static str, PerfMetrics> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn log_snapshot(&self) {
        for (op, m) in self.snapshot() {
            debug!(
                op,
                count = m.count,
                avg_ms = m.avg_ms(),
                max_ms = m.max.as_secs_f64() * 1_000.0,
                "live map perf"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_count_total_and_max() {
        let stats = PerfStats::new();
        stats.record(OP_MERGE, Duration::from_millis(2));
        stats.record(OP_MERGE, Duration::from_millis(6));

        let m = stats.get(OP_MERGE).unwrap();
        assert_eq!(m.count, 2);
        assert_eq!(m.total, Duration::from_millis(8));
        assert_eq!(m.max, Duration::from_millis(6));
        assert!((m.avg_ms() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn time_returns_closure_output() {
        let stats = PerfStats::new();
        assert_eq!(stats.time(OP_SCENE_BUILD, || 7), 7);
        assert_eq!(stats.get(OP_SCENE_BUILD).unwrap().count, 1);
        assert!(stats.get(OP_WORKSTATION_RELOAD).is_none());
    }

    #[test]
    fn empty_metrics_average_zero() {
        assert!(PerfMetrics::default().avg_ms().abs() < f64::EPSILON);
    }
}
