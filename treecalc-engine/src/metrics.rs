//! Calculation counters
//!
//! Cheap atomic counters updated on the meta thread and by worker commits;
//! [`CalcMetrics::snapshot`] gives a consistent-enough copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters of one session, shared with its workers
#[derive(Debug, Default)]
pub struct CalcMetrics {
    /// DataController lookups answered by the memo table
    pub memo_hits: AtomicU64,
    /// DataControllers created
    pub memo_misses: AtomicU64,
    /// Calculation rules compiled
    pub compilations: AtomicU64,
    /// Operator data computations run
    pub computations: AtomicU64,
    /// Computations served from the payload cache
    pub cache_hits: AtomicU64,
    /// Walks abandoned at a suspension point
    pub suspensions: AtomicU64,
    /// Failures memoized, meta info and data alike
    pub failures: AtomicU64,
    /// DataControllers removed by garbage collection
    pub collected: AtomicU64,
    /// Wall time spent in operator computations
    pub total_compute_time_ns: AtomicU64,
}

impl CalcMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a controller found in the memo table
    pub fn record_memo_hit(&self) {
        self.memo_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a controller created
    pub fn record_memo_miss(&self) {
        self.memo_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a compiled rule
    pub fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a computation that took `duration`
    pub fn record_computation(&self, duration: Duration) {
        self.computations.fetch_add(1, Ordering::Relaxed);
        self.total_compute_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Count a payload served from the cache
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a suspended walk
    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a memoized failure
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` controllers swept
    pub fn record_collected(&self, n: u64) {
        self.collected.fetch_add(n, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.memo_hits,
            &self.memo_misses,
            &self.compilations,
            &self.computations,
            &self.cache_hits,
            &self.suspensions,
            &self.failures,
            &self.collected,
            &self.total_compute_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Copy of the counters; each one is read on its own
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memo_hits: self.memo_hits.load(Ordering::Relaxed),
            memo_misses: self.memo_misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            total_time_ns: self.total_compute_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`CalcMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Controller lookups answered by the memo table
    pub memo_hits: u64,
    /// Controllers created
    pub memo_misses: u64,
    /// Rules compiled
    pub compilations: u64,
    /// Operator computations run
    pub computations: u64,
    /// Computations served from the payload cache
    pub cache_hits: u64,
    /// Suspended walks
    pub suspensions: u64,
    /// Memoized failures
    pub failures: u64,
    /// Controllers removed by garbage collection
    pub collected: u64,
    /// Total computation time in nanoseconds
    pub total_time_ns: u64,
}

impl MetricsSnapshot {
    /// Share of controller lookups that hit the memo
    pub fn memo_hit_rate(&self) -> f64 {
        let total = self.memo_hits + self.memo_misses;
        if total == 0 {
            0.0
        } else {
            self.memo_hits as f64 / total as f64
        }
    }

    /// Mean wall time of one computation
    pub fn avg_computation_time(&self) -> Duration {
        if self.computations == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_time_ns / self.computations)
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "  Memo: {} hits | {} misses | Hit Rate: {:.1}%",
            self.memo_hits,
            self.memo_misses,
            self.memo_hit_rate() * 100.0
        )?;
        writeln!(
            f,
            "  Compilations: {} | Computations: {} | Cache Hits: {}",
            self.compilations, self.computations, self.cache_hits
        )?;
        writeln!(
            f,
            "  Suspensions: {} | Failures: {} | Collected: {}",
            self.suspensions, self.failures, self.collected
        )?;
        writeln!(
            f,
            "  Avg Time: {:.3}ms",
            self.avg_computation_time().as_secs_f64() * 1000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_snapshot() {
        let m = CalcMetrics::new();
        m.record_memo_hit();
        m.record_memo_miss();
        m.record_memo_miss();
        m.record_computation(Duration::from_millis(4));
        m.record_computation(Duration::from_millis(2));
        let s = m.snapshot();
        assert_eq!(s.memo_misses, 2);
        assert!((s.memo_hit_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.avg_computation_time(), Duration::from_millis(3));
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
