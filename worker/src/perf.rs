//! Operation counting and latency tracking
//!
//! Each test gets one tracker. Workloads record per-operation
//! latencies; the runtime draws interval samples from it during RUN and
//! a final benchmark report afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

use gridbench_core::operation::{BenchmarkReport, LatencySnapshot, PerformanceSample};

/// Tracks operations and latencies for one test on one worker
pub struct OperationTracker {
    operations: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    // Microsecond precision, one hour ceiling.
    histogram: Histogram<u64>,
    run_started: Option<Instant>,
    run_stopped: Option<Instant>,
    last_sample_at: Option<Instant>,
    last_sample_count: u64,
}

impl OperationTracker {
    /// A fresh tracker with nothing recorded
    pub fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, 3_600_000_000, 3).expect("static histogram bounds");
        Self {
            operations: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                histogram,
                run_started: None,
                run_stopped: None,
                last_sample_at: None,
                last_sample_count: 0,
            }),
        }
    }

    /// Record one completed operation with its latency
    pub fn record(&self, latency: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let micros = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let mut inner = self.inner.lock().expect("tracker lock");
        // Saturates at the histogram ceiling instead of dropping.
        inner.histogram.saturating_record(micros.max(1));
    }

    /// Operations recorded so far
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Mark the beginning of the RUN phase
    pub fn mark_run_started(&self) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let now = Instant::now();
        inner.run_started = Some(now);
        inner.last_sample_at = Some(now);
        inner.last_sample_count = 0;
    }

    /// Mark the end of the RUN phase
    pub fn mark_run_stopped(&self) {
        let mut inner = self.inner.lock().expect("tracker lock");
        inner.run_stopped = Some(Instant::now());
    }

    /// Throughput over the interval since the previous sample
    pub fn interval_sample(&self, test_index: u32) -> PerformanceSample {
        let count = self.operation_count();
        let mut inner = self.inner.lock().expect("tracker lock");
        let now = Instant::now();

        let interval_ops_per_second = match inner.last_sample_at {
            Some(last) => {
                let secs = now.duration_since(last).as_secs_f64();
                if secs > 0.0 {
                    (count - inner.last_sample_count) as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        inner.last_sample_at = Some(now);
        inner.last_sample_count = count;

        PerformanceSample {
            test_index,
            operation_count: count,
            interval_ops_per_second,
            latency: snapshot(&inner.histogram),
        }
    }

    /// Final numbers for the whole RUN phase
    pub fn benchmark_report(&self, test_index: u32) -> BenchmarkReport {
        let count = self.operation_count();
        let inner = self.inner.lock().expect("tracker lock");

        let duration = match (inner.run_started, inner.run_stopped) {
            (Some(started), Some(stopped)) => stopped.duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        };
        let secs = duration.as_secs_f64();
        let ops_per_second = if secs > 0.0 { count as f64 / secs } else { 0.0 };

        BenchmarkReport {
            test_index,
            operation_count: count,
            duration_ms: duration.as_millis() as u64,
            ops_per_second,
            latency: snapshot(&inner.histogram),
        }
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(histogram: &Histogram<u64>) -> Option<LatencySnapshot> {
    if histogram.is_empty() {
        return None;
    }
    Some(LatencySnapshot {
        p50_us: histogram.value_at_quantile(0.50),
        p99_us: histogram.value_at_quantile(0.99),
        p999_us: histogram.value_at_quantile(0.999),
        max_us: histogram.max(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_latency_snapshot() {
        let tracker = OperationTracker::new();
        assert_eq!(tracker.operation_count(), 0);

        for ms in [1u64, 2, 3, 4, 100] {
            tracker.record(Duration::from_millis(ms));
        }
        assert_eq!(tracker.operation_count(), 5);

        let report = tracker.benchmark_report(1);
        let latency = report.latency.expect("recorded latencies");
        assert!(latency.max_us >= 99_000, "max {}", latency.max_us);
        assert!(latency.p50_us >= 1_000);
    }

    #[test]
    fn test_empty_tracker_has_no_latency() {
        let tracker = OperationTracker::new();
        let sample = tracker.interval_sample(1);
        assert_eq!(sample.operation_count, 0);
        assert!(sample.latency.is_none());
    }

    #[test]
    fn test_interval_sample_resets_window() {
        let tracker = OperationTracker::new();
        tracker.mark_run_started();

        tracker.record(Duration::from_micros(10));
        tracker.record(Duration::from_micros(10));
        std::thread::sleep(Duration::from_millis(5));
        let first = tracker.interval_sample(1);
        assert_eq!(first.operation_count, 2);
        assert!(first.interval_ops_per_second > 0.0);

        // No new operations: the next interval reports zero throughput.
        std::thread::sleep(Duration::from_millis(5));
        let second = tracker.interval_sample(1);
        assert_eq!(second.operation_count, 2);
        assert_eq!(second.interval_ops_per_second, 0.0);
    }

    #[test]
    fn test_benchmark_report_duration_window() {
        let tracker = OperationTracker::new();
        tracker.mark_run_started();
        tracker.record(Duration::from_micros(50));
        std::thread::sleep(Duration::from_millis(10));
        tracker.mark_run_stopped();

        let report = tracker.benchmark_report(3);
        assert_eq!(report.test_index, 3);
        assert!(report.duration_ms >= 10);
        assert!(report.ops_per_second > 0.0);
    }
}
