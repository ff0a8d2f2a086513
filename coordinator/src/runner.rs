//! Per-test state machine
//!
//! One runner drives one test through the whole phase lifecycle:
//! barrier gate, phase broadcast, completion wait, failure polling.
//! A worker with a terminal failure counts as having completed the
//! phase (absence = done). Transport errors fail this test only; the
//! suite decides whether that aborts the rest.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gridbench_core::address::SimulatorAddress;
use gridbench_core::operation::Operation;
use gridbench_core::phase::TestPhase;
use gridbench_core::registry::TestData;
use gridbench_core::response::ResponseType;
use gridbench_core::suite::TestSuite;

use crate::failures::FailureContainer;
use crate::listeners::PhaseCompletion;
use crate::performance::PerformanceStatsContainer;
use crate::remote::RemoteClient;
use crate::sync::TestPhaseSyncMap;

/// Tuning knobs for one runner
#[derive(Debug, Clone)]
pub struct TestCaseRunnerConfig {
    /// Run the verify phases
    pub verify_enabled: bool,
    /// Log aggregate throughput while RUN is in flight
    pub monitor_performance: bool,
    /// Cap on waiting for any single phase to complete everywhere
    pub phase_timeout: Duration,
    /// Cadence of the throughput log line during RUN
    pub run_log_interval: Duration,
    /// Granularity of the RUN sleep loop and completion polling
    pub sleep_slice: Duration,
}

impl Default for TestCaseRunnerConfig {
    fn default() -> Self {
        Self {
            verify_enabled: true,
            monitor_performance: false,
            phase_timeout: Duration::from_secs(300),
            run_log_interval: Duration::from_secs(30),
            sleep_slice: Duration::from_secs(1),
        }
    }
}

/// Drives one test case through all phases
pub struct TestCaseRunner {
    test: TestData,
    suite: TestSuite,
    remote: Arc<RemoteClient>,
    failures: Arc<FailureContainer>,
    performance: Arc<PerformanceStatsContainer>,
    completions: mpsc::UnboundedReceiver<PhaseCompletion>,
    phase_sync: Arc<TestPhaseSyncMap>,
    cancel: CancellationToken,
    config: TestCaseRunnerConfig,
    prefix: String,
    gated: HashSet<TestPhase>,
}

impl TestCaseRunner {
    /// Assemble a runner for one registered test
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        test: TestData,
        suite: TestSuite,
        remote: Arc<RemoteClient>,
        failures: Arc<FailureContainer>,
        performance: Arc<PerformanceStatsContainer>,
        completions: mpsc::UnboundedReceiver<PhaseCompletion>,
        phase_sync: Arc<TestPhaseSyncMap>,
        cancel: CancellationToken,
        config: TestCaseRunnerConfig,
        pad_to: usize,
    ) -> Self {
        let prefix = format!("{:pad_to$}", test.case.id);
        Self {
            test,
            suite,
            remote,
            failures,
            performance,
            completions,
            phase_sync,
            cancel,
            config,
            prefix,
            gated: HashSet::new(),
        }
    }

    /// Replace the cancellation token (parallel runs share one)
    pub fn set_cancel(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Run the test to completion; `true` means it passed
    pub async fn run(mut self) -> bool {
        let passed = self.run_inner().await;

        // Release every gate this runner never reached so parallel
        // siblings cannot deadlock on an aborted test.
        for phase in TestPhase::iter() {
            if !self.gated.contains(&phase) {
                self.phase_sync.latch(phase).count_down();
            }
        }

        if passed {
            info!("{} Test passed", self.prefix);
        } else {
            error!("{} Test failed", self.prefix);
        }
        passed
    }

    async fn run_inner(&mut self) -> bool {
        if self.remote.registry().worker_count() == 0 {
            error!("{} No workers to run on", self.prefix);
            return false;
        }

        if !self.init_test().await {
            return false;
        }

        let mut failed = false;
        for phase in [
            TestPhase::Setup,
            TestPhase::LocalWarmup,
            TestPhase::GlobalWarmup,
        ] {
            if !self.execute_phase(phase, false).await {
                failed = true;
                break;
            }
        }

        if !failed {
            failed = !self.execute_run().await;
        }

        if !failed && self.config.verify_enabled {
            failed = !self.execute_phase(TestPhase::GlobalVerify, false).await
                || !self.execute_phase(TestPhase::LocalVerify, false).await;
        }

        // Teardown is attempted even for a failed test.
        failed |= !self.execute_phase(TestPhase::GlobalTeardown, true).await;
        failed |= !self.execute_phase(TestPhase::LocalTeardown, true).await;

        failed |= self.has_critical();
        !failed
    }

    async fn init_test(&mut self) -> bool {
        info!("{} Initializing test", self.prefix);
        let operation = Operation::InitTest {
            test_index: self.test.test_index,
            case: self.test.case.clone(),
        };
        match self.remote.send_to_all_workers(operation).await {
            Ok(response) => match response.first_error() {
                None => true,
                Some((address, response_type)) => {
                    error!(
                        "{} Init failed on {address}: {response_type}",
                        self.prefix
                    );
                    false
                }
            },
            Err(err) => {
                error!("{} Init failed: {err}", self.prefix);
                false
            }
        }
    }

    /// Gate, broadcast, and await one phase
    ///
    /// `even_on_failure` lets teardown proceed after earlier failures.
    async fn execute_phase(&mut self, phase: TestPhase, even_on_failure: bool) -> bool {
        if !self.await_gate(phase).await {
            return false;
        }
        if !even_on_failure && self.has_critical() {
            warn!("{} Skipping {phase}: critical failure detected", self.prefix);
            return false;
        }

        let targets = self.phase_targets(phase);
        if targets.is_empty() {
            // Every target is already gone; nothing left to command.
            return true;
        }

        info!("{} Starting {phase} phase", self.prefix);
        let Some(expected) = self.start_phase(phase, &targets).await else {
            return false;
        };
        self.wait_phase_completion(phase, expected).await
    }

    async fn execute_run(&mut self) -> bool {
        let phase = TestPhase::Run;
        if !self.await_gate(phase).await {
            return false;
        }
        if self.has_critical() {
            return false;
        }

        // With duration 0 there is no run window and no Stop step; the
        // phase itself is still commanded and awaited.
        let skip_stop = self.suite.duration_seconds == 0 && !self.suite.wait_for_test_case;

        // Heartbeat timeouts are only meaningful while tests run.
        let _ = self
            .remote
            .send_to_all_agents(Operation::StartTimeoutDetection)
            .await;

        let targets = self.phase_targets(phase);
        if targets.is_empty() {
            return true;
        }

        info!("{} Starting run phase", self.prefix);
        let Some(mut expected) = self.start_phase(phase, &targets).await else {
            return false;
        };

        let mut ok = true;
        if skip_stop {
            info!("{} Skipping run window (duration 0)", self.prefix);
        } else if self.suite.wait_for_test_case {
            info!("{} Running until the test stops itself", self.prefix);
            let cap = if self.suite.duration_seconds > 0 {
                Duration::from_secs(self.suite.duration_seconds)
            } else {
                self.config.phase_timeout
            };
            self.await_completions(phase, &mut expected, cap).await;
        } else {
            info!(
                "{} Running for {} seconds",
                self.prefix, self.suite.duration_seconds
            );
            ok = self.sleep_run_window().await;
        }

        if ok && !skip_stop {
            ok = self.stop_run(&targets).await;
        }
        if ok && !expected.is_empty() {
            ok = self.wait_phase_completion(phase, expected).await;
        }

        let _ = self
            .remote
            .send_to_all_agents(Operation::StopTimeoutDetection)
            .await;

        // Best-effort result collection; a timeout here is not fatal.
        self.collect_benchmark_results(&targets).await;
        ok
    }

    async fn stop_run(&mut self, targets: &[SimulatorAddress]) -> bool {
        info!("{} Stopping run", self.prefix);
        let operation = Operation::StopRun {
            test_id: self.test.case.id.clone(),
            test_index: self.test.test_index,
        };
        match self.remote.broadcast(targets, operation).await {
            Ok(response) => {
                for (address, response_type) in response.entries {
                    match response_type {
                        ResponseType::Success
                        | ResponseType::FailureWorkerNotFound
                        | ResponseType::UnblockedByFailure => {}
                        other => {
                            error!("{} Stop failed on {address}: {other}", self.prefix);
                            return false;
                        }
                    }
                }
                true
            }
            Err(err) => {
                error!("{} Stop failed: {err}", self.prefix);
                false
            }
        }
    }

    async fn collect_benchmark_results(&mut self, targets: &[SimulatorAddress]) {
        let operation = Operation::GetBenchmarkResults {
            test_id: self.test.case.id.clone(),
            test_index: self.test.test_index,
        };
        match self.remote.broadcast(targets, operation).await {
            Ok(response) => {
                if let Some((address, response_type)) = response.first_error() {
                    warn!(
                        "{} No benchmark results from {address}: {response_type}",
                        self.prefix
                    );
                }
            }
            Err(err) => warn!("{} Benchmark result collection failed: {err}", self.prefix),
        }

        for (worker, report) in self.performance.reports(self.test.test_index) {
            info!(
                "{} {worker}: {} ops in {} ms ({:.2} ops/s)",
                self.prefix, report.operation_count, report.duration_ms, report.ops_per_second
            );
        }
    }

    /// Broadcast `StartPhase` and classify per-target acks
    ///
    /// Returns the targets still expected to report completion, or
    /// `None` when the phase failed to start. A missing or just-died
    /// worker is treated as already complete.
    async fn start_phase(
        &mut self,
        phase: TestPhase,
        targets: &[SimulatorAddress],
    ) -> Option<BTreeSet<SimulatorAddress>> {
        let operation = Operation::StartPhase {
            test_id: self.test.case.id.clone(),
            test_index: self.test.test_index,
            phase,
        };
        let response = match self.remote.broadcast(targets, operation).await {
            Ok(response) => response,
            Err(err) => {
                error!("{} Could not start {phase}: {err}", self.prefix);
                return None;
            }
        };

        let mut expected: BTreeSet<SimulatorAddress> = targets.iter().copied().collect();
        for (address, response_type) in response.entries {
            match response_type {
                ResponseType::Success => {}
                ResponseType::FailureWorkerNotFound | ResponseType::UnblockedByFailure => {
                    expected.remove(&address);
                }
                other => {
                    error!("{} {phase} failed on {address}: {other}", self.prefix);
                    return None;
                }
            }
        }
        Some(expected)
    }

    /// Wait until every expected worker reported the phase, died, or
    /// the phase timeout expired
    async fn wait_phase_completion(
        &mut self,
        phase: TestPhase,
        mut expected: BTreeSet<SimulatorAddress>,
    ) -> bool {
        let done = self
            .await_completions(phase, &mut expected, self.config.phase_timeout)
            .await;
        if !done && !expected.is_empty() {
            error!(
                "{} Waiting for {phase} completion timed out ({} workers missing)",
                self.prefix,
                expected.len()
            );
        }
        done
    }

    async fn await_completions(
        &mut self,
        phase: TestPhase,
        expected: &mut BTreeSet<SimulatorAddress>,
        cap: Duration,
    ) -> bool {
        let deadline = Instant::now() + cap;
        loop {
            // Dead workers count as done.
            for finished in self.failures.finished_workers() {
                expected.remove(&finished);
            }
            if expected.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                completion = self.completions.recv() => {
                    match completion {
                        Some(PhaseCompletion { worker, phase: completed }) if completed == phase => {
                            expected.remove(&worker);
                        }
                        Some(_) => {}
                        None => return false,
                    }
                }
                _ = tokio::time::sleep(self.config.sleep_slice) => {}
            }
        }
    }

    /// Sleep through the RUN window, logging throughput and breaking
    /// early on critical failures
    async fn sleep_run_window(&mut self) -> bool {
        let total = Duration::from_secs(self.suite.duration_seconds);
        let started = Instant::now();
        let mut last_log = Instant::now();

        while started.elapsed() < total {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.sleep_slice.min(total.saturating_sub(started.elapsed()))) => {}
            }

            if self.has_critical() {
                warn!("{} Critical failure detected, ending run early", self.prefix);
                break;
            }

            if self.config.monitor_performance && last_log.elapsed() >= self.config.run_log_interval
            {
                info!(
                    "{} {}",
                    self.prefix,
                    self.performance.format_throughput(self.test.test_index)
                );
                last_log = Instant::now();
            }
        }
        true
    }

    /// Count down and wait at the phase barrier
    async fn await_gate(&mut self, phase: TestPhase) -> bool {
        self.gated.insert(phase);
        let latch = self.phase_sync.latch(phase);
        latch.count_down();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = latch.wait() => true,
        }
    }

    /// Worker addresses commanded for a phase: all of them, or just the
    /// designated first worker for global phases
    fn phase_targets(&self, phase: TestPhase) -> Vec<SimulatorAddress> {
        if phase.is_global() {
            self.remote
                .registry()
                .first_worker()
                .map(|worker| vec![worker.address])
                .unwrap_or_default()
        } else {
            self.remote.registry().worker_addresses()
        }
    }

    fn has_critical(&self) -> bool {
        self.failures
            .has_critical_failure(&self.suite.tolerable_failures)
    }
}
