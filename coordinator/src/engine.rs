//! The coordinator's top-level test-suite engine
//!
//! Wires the containers, connector, and remote client together, then
//! drives the suite: connect to agents, register the suite, start
//! workers, run every test (sequentially or in parallel), terminate
//! workers, and report the failure verdict.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gridbench_core::operation::WorkerType;
use gridbench_core::phase::TestPhase;
use gridbench_core::registry::{ComponentRegistry, TestData};
use gridbench_core::suite::TestSuite;

use crate::connector::{spawn_failure_dispatcher, CoordinatorConnector};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::failures::FailureContainer;
use crate::listeners::TestPhaseListeners;
use crate::performance::PerformanceStatsContainer;
use crate::remote::RemoteClient;
use crate::runner::{TestCaseRunner, TestCaseRunnerConfig};
use crate::sync::TestPhaseSyncMap;

/// Engine settings, normally filled from the CLI
#[derive(Debug, Clone)]
pub struct CoordinatorParameters {
    /// Port every agent endpoint listens on
    pub agent_port: u16,
    /// Member workers launched per agent
    pub members_per_agent: usize,
    /// Client workers launched per agent
    pub clients_per_agent: usize,
    /// Run tests concurrently instead of in declared order
    pub parallel: bool,
    /// Restart all workers between sequential tests
    pub refresh_workers: bool,
    /// Last phase synchronized across parallel tests
    pub last_phase_to_sync: Option<TestPhase>,
    /// Sleep after terminating workers so late failures still arrive
    pub cooldown_seconds: u64,
    /// How long to wait for workers to confirm shutdown
    pub worker_shutdown_timeout: Duration,
    /// Per-operation response deadline
    pub operation_timeout: Duration,
    /// Runner tuning (verify, performance monitoring, timeouts)
    pub runner: TestCaseRunnerConfig,
}

impl Default for CoordinatorParameters {
    fn default() -> Self {
        Self {
            agent_port: 9500,
            members_per_agent: 1,
            clients_per_agent: 0,
            parallel: false,
            refresh_workers: false,
            last_phase_to_sync: Some(TestPhase::Setup),
            cooldown_seconds: 10,
            worker_shutdown_timeout: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(60),
            runner: TestCaseRunnerConfig::default(),
        }
    }
}

/// Top-level controller of one suite run
pub struct Coordinator {
    parameters: CoordinatorParameters,
    suite: TestSuite,
    registry: Arc<ComponentRegistry>,
    failures: Arc<FailureContainer>,
    performance: Arc<PerformanceStatsContainer>,
    listeners: Arc<TestPhaseListeners>,
    connector: Arc<CoordinatorConnector>,
    remote: Arc<RemoteClient>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Assemble the engine around a registry of configured agents
    pub fn new(
        parameters: CoordinatorParameters,
        suite: TestSuite,
        registry: Arc<ComponentRegistry>,
    ) -> Self {
        let failures = Arc::new(FailureContainer::new());
        let performance = Arc::new(PerformanceStatsContainer::new());
        let listeners = Arc::new(TestPhaseListeners::new());
        let cancel = CancellationToken::new();
        let connector = CoordinatorConnector::new(
            Arc::clone(&failures),
            Arc::clone(&listeners),
            Arc::clone(&performance),
            cancel.clone(),
        );
        let remote = Arc::new(RemoteClient::with_timeout(
            Arc::clone(&connector),
            Arc::clone(&registry),
            parameters.operation_timeout,
        ));
        spawn_failure_dispatcher(
            &failures,
            Arc::clone(&connector),
            Arc::clone(&registry),
            cancel.clone(),
        );

        Self {
            parameters,
            suite,
            registry,
            failures,
            performance,
            listeners,
            connector,
            remote,
            cancel,
        }
    }

    /// The failure container for this run
    pub fn failures(&self) -> &Arc<FailureContainer> {
        &self.failures
    }

    /// The connector, for attaching pre-established connections
    pub fn connector(&self) -> &Arc<CoordinatorConnector> {
        &self.connector
    }

    /// Cancellation token aborting the whole run
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run everything: connect, start workers, execute, terminate
    ///
    /// `Ok(true)` means no critical failure was recorded.
    pub async fn run(&self) -> CoordinatorResult<bool> {
        self.connect_agents().await?;
        self.remote.init_test_suite(&self.suite).await?;
        self.start_workers().await?;

        let suite_passed = self.run_test_suite().await?;
        let verdict = self.report_failures();
        Ok(suite_passed && verdict)
    }

    /// Dial every configured agent; any unreachable agent aborts the
    /// run before a single worker is launched
    pub async fn connect_agents(&self) -> CoordinatorResult<()> {
        let agents = self.registry.agents();
        if agents.is_empty() {
            return Err(CoordinatorError::NoAgents);
        }
        for agent in &agents {
            self.connector
                .connect(agent, self.parameters.agent_port)
                .await?;
        }
        info!(count = agents.len(), "All agents connected");
        Ok(())
    }

    /// Launch the configured number of workers on every agent
    pub async fn start_workers(&self) -> CoordinatorResult<()> {
        for agent in self.registry.agents() {
            self.remote
                .create_workers(
                    agent.address,
                    WorkerType::Member,
                    self.parameters.members_per_agent,
                )
                .await?;
            self.remote
                .create_workers(
                    agent.address,
                    WorkerType::Client,
                    self.parameters.clients_per_agent,
                )
                .await?;
        }
        let count = self.registry.worker_count();
        if count == 0 {
            return Err(CoordinatorError::NoWorkers);
        }
        info!(count, "Workers started");
        Ok(())
    }

    /// Execute every test of the suite and terminate the workers
    pub async fn run_test_suite(&self) -> CoordinatorResult<bool> {
        self.echo(&format!(
            "Starting test suite {} ({} tests, {}s per test)",
            self.suite.id,
            self.suite.size(),
            self.suite.duration_seconds
        ))
        .await;

        let tests = self.registry.add_tests(&self.suite);
        let passed = if self.parameters.parallel && tests.len() > 1 {
            self.run_parallel(tests).await
        } else {
            self.run_sequential(tests).await?
        };

        self.remote
            .terminate_workers(
                true,
                &self.failures,
                self.parameters.worker_shutdown_timeout,
            )
            .await?;

        if self.parameters.cooldown_seconds > 0 {
            // Late failure reports are still in flight right after
            // termination.
            info!(
                seconds = self.parameters.cooldown_seconds,
                "Cooling down"
            );
            tokio::time::sleep(Duration::from_secs(self.parameters.cooldown_seconds)).await;
        }

        Ok(passed)
    }

    async fn run_sequential(&self, tests: Vec<TestData>) -> CoordinatorResult<bool> {
        info!(count = tests.len(), "Running tests sequentially");
        let sync = Arc::new(TestPhaseSyncMap::no_sync());
        let total = tests.len();
        let mut all_passed = true;

        for (position, test) in tests.into_iter().enumerate() {
            let test_index = test.test_index;
            let runner = self.make_runner(test, Arc::clone(&sync));
            let passed = runner.run().await;
            self.listeners.unregister(test_index);
            all_passed &= passed;

            if !passed && self.suite.fail_fast {
                self.echo("Aborting test suite (fail fast)").await;
                break;
            }
            let restart = !passed || self.parameters.refresh_workers;
            if restart && position + 1 < total {
                self.restart_workers().await?;
            }
        }
        Ok(all_passed)
    }

    async fn run_parallel(&self, tests: Vec<TestData>) -> bool {
        info!(count = tests.len(), "Running tests in parallel");
        let sync = Arc::new(TestPhaseSyncMap::new(
            tests.len(),
            self.parameters.last_phase_to_sync,
        ));
        let runner_cancel = self.cancel.child_token();
        let test_indexes: Vec<u32> = tests.iter().map(|test| test.test_index).collect();

        let mut runners = JoinSet::new();
        for test in tests {
            let mut runner = self.make_runner(test, Arc::clone(&sync));
            runner.set_cancel(runner_cancel.clone());
            runners.spawn(runner.run());
        }

        let mut all_passed = true;
        while let Some(outcome) = runners.join_next().await {
            let passed = outcome.unwrap_or(false);
            all_passed &= passed;
            if !passed && self.suite.fail_fast && !runner_cancel.is_cancelled() {
                self.echo("Aborting in-flight tests (fail fast)").await;
                runner_cancel.cancel();
            }
        }

        for test_index in test_indexes {
            self.listeners.unregister(test_index);
        }
        all_passed
    }

    fn make_runner(&self, test: TestData, sync: Arc<TestPhaseSyncMap>) -> TestCaseRunner {
        let completions = self.listeners.register(test.test_index);
        TestCaseRunner::new(
            test,
            self.suite.clone(),
            Arc::clone(&self.remote),
            Arc::clone(&self.failures),
            Arc::clone(&self.performance),
            completions,
            sync,
            self.cancel.child_token(),
            self.parameters.runner.clone(),
            self.suite.max_case_id_len(),
        )
    }

    /// Terminate and relaunch the whole worker fleet
    async fn restart_workers(&self) -> CoordinatorResult<()> {
        self.echo("Restarting workers").await;
        self.remote
            .terminate_workers(
                true,
                &self.failures,
                self.parameters.worker_shutdown_timeout,
            )
            .await?;
        self.registry.clear_workers();
        self.start_workers().await
    }

    /// Final verdict line; `true` means no critical failure
    fn report_failures(&self) -> bool {
        let failure_count = self.failures.failure_count();
        let critical = self
            .failures
            .has_critical_failure(&self.suite.tolerable_failures);
        if critical {
            error!("{failure_count} failures have been detected");
            return false;
        }
        info!("No critical failures have been detected ({failure_count} total reports)");
        true
    }

    /// Log locally and fan the line out to every agent's log
    async fn echo(&self, message: &str) {
        info!("{message}");
        self.remote.log_on_all_agents(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_fake_agent, FakeAgentBehavior, FakeAgentLog};
    use gridbench_core::address::SimulatorAddress;
    use gridbench_core::response::ResponseType;
    use gridbench_core::suite::TestCase;

    fn parameters() -> CoordinatorParameters {
        CoordinatorParameters {
            cooldown_seconds: 0,
            worker_shutdown_timeout: Duration::from_millis(200),
            operation_timeout: Duration::from_secs(5),
            runner: TestCaseRunnerConfig {
                phase_timeout: Duration::from_secs(5),
                sleep_slice: Duration::from_millis(20),
                ..TestCaseRunnerConfig::default()
            },
            ..CoordinatorParameters::default()
        }
    }

    fn suite(duration_seconds: u64, ids: &[&str]) -> TestSuite {
        let mut suite = TestSuite::with_id("suite");
        suite.duration_seconds = duration_seconds;
        for id in ids {
            suite.add_test(TestCase::new(*id).with_property("class", "success"));
        }
        suite
    }

    struct Fixture {
        coordinator: Coordinator,
        log: Arc<FakeAgentLog>,
    }

    fn fixture(parameters: CoordinatorParameters, suite: TestSuite, workers: usize) -> Fixture {
        let registry = Arc::new(ComponentRegistry::new());
        registry.add_agent("10.0.0.1".into(), "192.168.0.1".into());
        let coordinator = Coordinator::new(parameters, suite, Arc::clone(&registry));

        let behavior = FakeAgentBehavior {
            auto_complete_phases: true,
            workers: (1..=workers as u32)
                .map(|index| SimulatorAddress::worker(1, index))
                .collect(),
            ..Default::default()
        };
        let (coordinator_side, agent_side) = tokio::io::duplex(256 * 1024);
        coordinator.connector().attach(1, coordinator_side);
        let log = spawn_fake_agent(agent_side, 1, behavior);

        Fixture { coordinator, log }
    }

    /// Start workers, run the suite, and return the suite verdict
    async fn run_fixture(fixture: &Fixture) -> bool {
        fixture
            .coordinator
            .remote
            .init_test_suite(&fixture.coordinator.suite)
            .await
            .unwrap();
        fixture.coordinator.start_workers().await.unwrap();
        fixture.coordinator.run_test_suite().await.unwrap()
    }

    fn phase_positions(log: &FakeAgentLog, needle: &str) -> Vec<usize> {
        log.tags()
            .iter()
            .enumerate()
            .filter(|(_, tag)| tag.as_str() == needle)
            .map(|(position, _)| position)
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_suite_runs_every_phase_in_order() {
        let fixture = fixture(parameters(), suite(0, &["map"]), 1);
        let passed = run_fixture(&fixture).await;
        assert!(passed);

        let tags = fixture.log.tags();
        let order: Vec<&str> = tags
            .iter()
            .filter(|tag| tag.starts_with("startPhase:"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            order,
            vec![
                "startPhase:setup:t1",
                "startPhase:localWarmup:t1",
                "startPhase:globalWarmup:t1",
                "startPhase:run:t1",
                "startPhase:globalVerify:t1",
                "startPhase:localVerify:t1",
                "startPhase:globalTeardown:t1",
                "startPhase:localTeardown:t1",
            ]
        );
        // duration 0: only the Stop step is skipped; results are still
        // collected.
        assert_eq!(fixture.log.count_of("stopRun"), 0);
        assert_eq!(fixture.log.count_of("getBenchmarkResults"), 1);
        assert_eq!(fixture.log.count_of("terminateWorkers"), 1);
    }

    #[tokio::test]
    async fn test_run_phase_starts_stops_and_collects_results() {
        let mut parameters = parameters();
        parameters.runner.sleep_slice = Duration::from_millis(20);
        let fixture = fixture(parameters, suite(1, &["map"]), 1);

        let passed = run_fixture(&fixture).await;
        assert!(passed);

        assert_eq!(fixture.log.count_of("startPhase:run:t1"), 1);
        assert_eq!(fixture.log.count_of("stopRun"), 1);
        assert_eq!(fixture.log.count_of("getBenchmarkResults"), 1);
        assert_eq!(fixture.log.count_of("startTimeoutDetection"), 1);
        assert_eq!(fixture.log.count_of("stopTimeoutDetection"), 1);
    }

    #[tokio::test]
    async fn test_global_phases_go_to_first_worker_only() {
        let fixture = fixture(parameters(), suite(0, &["map"]), 2);
        run_fixture(&fixture).await;

        let destinations = fixture.log.destinations();
        let global_warmups: Vec<SimulatorAddress> = destinations
            .iter()
            .filter(|(_, tag)| tag.starts_with("startPhase:globalWarmup"))
            .map(|(destination, _)| *destination)
            .collect();
        assert_eq!(global_warmups, vec![SimulatorAddress::worker(1, 1)]);

        let setups = destinations
            .iter()
            .filter(|(_, tag)| tag.starts_with("startPhase:setup"))
            .count();
        assert_eq!(setups, 2);
    }

    #[tokio::test]
    async fn test_parallel_tests_synchronize_up_to_the_configured_phase() {
        let mut parameters = parameters();
        parameters.parallel = true;
        parameters.last_phase_to_sync = Some(TestPhase::GlobalWarmup);
        let fixture = fixture(parameters, suite(0, &["a", "b"]), 1);

        let passed = run_fixture(&fixture).await;
        assert!(passed);

        // No test may enter localWarmup before both finished setup.
        let setups = [
            phase_positions(&fixture.log, "startPhase:setup:t1"),
            phase_positions(&fixture.log, "startPhase:setup:t2"),
        ];
        let warmups = [
            phase_positions(&fixture.log, "startPhase:localWarmup:t1"),
            phase_positions(&fixture.log, "startPhase:localWarmup:t2"),
        ];
        let last_setup = setups.iter().flatten().copied().max().unwrap();
        let first_warmup = warmups.iter().flatten().copied().min().unwrap();
        assert!(
            last_setup < first_warmup,
            "setup positions {setups:?}, warmup positions {warmups:?}"
        );
    }

    #[tokio::test]
    async fn test_failing_phase_fails_the_test_but_still_tears_down() {
        let mut fixture_parameters = parameters();
        fixture_parameters.runner.verify_enabled = true;
        let registry = Arc::new(ComponentRegistry::new());
        registry.add_agent("10.0.0.1".into(), "192.168.0.1".into());
        let coordinator =
            Coordinator::new(fixture_parameters, suite(0, &["map"]), Arc::clone(&registry));

        let behavior = FakeAgentBehavior {
            auto_complete_phases: true,
            fail_phase: Some((
                TestPhase::Setup,
                ResponseType::ExceptionDuringOperationExecution,
            )),
            workers: vec![SimulatorAddress::worker(1, 1)],
            ..Default::default()
        };
        let (coordinator_side, agent_side) = tokio::io::duplex(256 * 1024);
        coordinator.connector().attach(1, coordinator_side);
        let log = spawn_fake_agent(agent_side, 1, behavior);

        coordinator.start_workers().await.unwrap();
        let passed = coordinator.run_test_suite().await.unwrap();
        assert!(!passed);

        // Verify is skipped after the failure; teardown still runs.
        assert_eq!(log.count_of("startPhase:globalVerify:t1"), 0);
        assert_eq!(log.count_of("startPhase:globalTeardown:t1"), 1);
        assert_eq!(log.count_of("startPhase:localTeardown:t1"), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_sequential_tests() {
        let mut suite = suite(0, &["first", "second"]);
        suite.fail_fast = true;
        let registry = Arc::new(ComponentRegistry::new());
        registry.add_agent("10.0.0.1".into(), "192.168.0.1".into());
        let coordinator = Coordinator::new(parameters(), suite, Arc::clone(&registry));

        let behavior = FakeAgentBehavior {
            auto_complete_phases: true,
            fail_phase: Some((
                TestPhase::Setup,
                ResponseType::ExceptionDuringOperationExecution,
            )),
            workers: vec![SimulatorAddress::worker(1, 1)],
            ..Default::default()
        };
        let (coordinator_side, agent_side) = tokio::io::duplex(256 * 1024);
        coordinator.connector().attach(1, coordinator_side);
        let log = spawn_fake_agent(agent_side, 1, behavior);

        coordinator.start_workers().await.unwrap();
        let passed = coordinator.run_test_suite().await.unwrap();
        assert!(!passed);

        // The second test is never initialized.
        assert_eq!(log.count_of("initTest"), 1);
    }

    #[tokio::test]
    async fn test_dead_worker_counts_as_phase_complete() {
        let registry = Arc::new(ComponentRegistry::new());
        registry.add_agent("10.0.0.1".into(), "192.168.0.1".into());
        let coordinator = Coordinator::new(parameters(), suite(0, &["map"]), Arc::clone(&registry));

        let behavior = FakeAgentBehavior {
            auto_complete_phases: true,
            fail_phase: Some((TestPhase::LocalVerify, ResponseType::FailureWorkerNotFound)),
            workers: vec![SimulatorAddress::worker(1, 1)],
            ..Default::default()
        };
        let (coordinator_side, agent_side) = tokio::io::duplex(256 * 1024);
        coordinator.connector().attach(1, coordinator_side);
        let log = spawn_fake_agent(agent_side, 1, behavior);

        coordinator.start_workers().await.unwrap();
        let passed = coordinator.run_test_suite().await.unwrap();

        // Absence counts as completion: the suite still passes.
        assert!(passed);
        assert_eq!(log.count_of("startPhase:localTeardown:t1"), 1);
    }

    #[tokio::test]
    async fn test_benchmark_result_timeout_is_not_fatal() {
        let mut fixture_parameters = parameters();
        fixture_parameters.operation_timeout = Duration::from_millis(200);
        let registry = Arc::new(ComponentRegistry::new());
        registry.add_agent("10.0.0.1".into(), "192.168.0.1".into());
        let coordinator =
            Coordinator::new(fixture_parameters, suite(1, &["map"]), Arc::clone(&registry));

        let behavior = FakeAgentBehavior {
            auto_complete_phases: true,
            silent_ops: std::collections::HashSet::from(["getBenchmarkResults"]),
            workers: vec![SimulatorAddress::worker(1, 1)],
            ..Default::default()
        };
        let (coordinator_side, agent_side) = tokio::io::duplex(256 * 1024);
        coordinator.connector().attach(1, coordinator_side);
        let log = spawn_fake_agent(agent_side, 1, behavior);

        coordinator.start_workers().await.unwrap();
        let passed = coordinator.run_test_suite().await.unwrap();

        // The timeout is swallowed; verify and teardown still happen.
        assert!(passed);
        assert_eq!(log.count_of("startPhase:globalVerify:t1"), 1);
        assert_eq!(log.count_of("startPhase:localTeardown:t1"), 1);
        assert!(!coordinator
            .failures()
            .has_critical_failure(&coordinator.suite.tolerable_failures));
    }

    #[tokio::test]
    async fn test_unreachable_agent_aborts_before_workers() {
        let mut fixture_parameters = parameters();
        // Nothing listens on port 1.
        fixture_parameters.agent_port = 1;
        let registry = Arc::new(ComponentRegistry::new());
        registry.add_agent("127.0.0.1".into(), "127.0.0.1".into());
        let coordinator = Coordinator::new(fixture_parameters, suite(0, &["map"]), registry);

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_no_agents_is_fatal_before_workers() {
        let registry = Arc::new(ComponentRegistry::new());
        let coordinator = Coordinator::new(parameters(), suite(0, &["map"]), registry);
        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoAgents));
    }
}
