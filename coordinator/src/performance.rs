//! Performance aggregation on the coordinator
//!
//! Workers stream throughput snapshots while RUN is in flight and ship
//! one benchmark report per test at the end. The container keeps the
//! latest sample per `(test, worker)` pair and renders the periodic
//! throughput log line for the runner.

use std::collections::HashMap;
use std::sync::Mutex;

use gridbench_core::address::SimulatorAddress;
use gridbench_core::operation::{BenchmarkReport, PerformanceSample};

#[derive(Default)]
struct Inner {
    samples: HashMap<(u32, SimulatorAddress), PerformanceSample>,
    reports: HashMap<(u32, SimulatorAddress), BenchmarkReport>,
}

/// Coordinator-side sink for performance data
#[derive(Default)]
pub struct PerformanceStatsContainer {
    inner: Mutex<Inner>,
}

impl PerformanceStatsContainer {
    /// An empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a periodic sample from a worker
    pub fn update(&self, worker: SimulatorAddress, sample: PerformanceSample) {
        let mut inner = self.inner.lock().expect("performance lock");
        inner.samples.insert((sample.test_index, worker), sample);
    }

    /// Accept a final benchmark report from a worker
    pub fn store_report(&self, worker: SimulatorAddress, report: BenchmarkReport) {
        let mut inner = self.inner.lock().expect("performance lock");
        inner.reports.insert((report.test_index, worker), report);
    }

    /// Total operations across all workers of one test
    pub fn operation_count(&self, test_index: u32) -> u64 {
        self.inner
            .lock()
            .expect("performance lock")
            .samples
            .iter()
            .filter(|((test, _), _)| *test == test_index)
            .map(|(_, sample)| sample.operation_count)
            .sum()
    }

    /// Current combined throughput across all workers of one test
    pub fn throughput(&self, test_index: u32) -> f64 {
        self.inner
            .lock()
            .expect("performance lock")
            .samples
            .iter()
            .filter(|((test, _), _)| *test == test_index)
            .map(|(_, sample)| sample.interval_ops_per_second)
            .sum()
    }

    /// Number of workers that have reported samples for one test
    pub fn reporting_workers(&self, test_index: u32) -> usize {
        self.inner
            .lock()
            .expect("performance lock")
            .samples
            .keys()
            .filter(|(test, _)| *test == test_index)
            .count()
    }

    /// The runner's periodic throughput line
    pub fn format_throughput(&self, test_index: u32) -> String {
        format!(
            "{:>12} ops {:>12.2} ops/s ({} workers reporting)",
            self.operation_count(test_index),
            self.throughput(test_index),
            self.reporting_workers(test_index),
        )
    }

    /// All benchmark reports for one test, in worker-address order
    pub fn reports(&self, test_index: u32) -> Vec<(SimulatorAddress, BenchmarkReport)> {
        let inner = self.inner.lock().expect("performance lock");
        let mut reports: Vec<(SimulatorAddress, BenchmarkReport)> = inner
            .reports
            .iter()
            .filter(|((test, _), _)| *test == test_index)
            .map(|((_, worker), report)| (*worker, report.clone()))
            .collect();
        reports.sort_by_key(|(worker, _)| *worker);
        reports
    }

    /// Combined operations across every test's reports (final summary)
    pub fn total_reported_operations(&self) -> u64 {
        self.inner
            .lock()
            .expect("performance lock")
            .reports
            .values()
            .map(|report| report.operation_count)
            .sum()
    }
}
