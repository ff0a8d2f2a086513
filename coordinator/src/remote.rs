//! Remote client: synchronous-looking fan-out over the connector
//!
//! Wraps the coordinator connector with the registry so callers can
//! address "all workers", "the first worker", or "all agents" without
//! handling per-connection details. Every call either returns an
//! all-success response or surfaces the first non-success entry.

use std::time::Duration;

use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use gridbench_core::address::SimulatorAddress;
use gridbench_core::operation::{LogLevel, Operation, WorkerSettings, WorkerType};
use gridbench_core::registry::{ComponentRegistry, WorkerData};
use gridbench_core::response::{Response, ResponseType};
use gridbench_core::suite::TestSuite;

use crate::connector::CoordinatorConnector;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::failures::FailureContainer;

/// Default per-operation response deadline
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Coordinator-side façade for talking to agents and workers
pub struct RemoteClient {
    connector: Arc<CoordinatorConnector>,
    registry: Arc<ComponentRegistry>,
    operation_timeout: Duration,
}

impl RemoteClient {
    /// Create a client with the default operation timeout
    pub fn new(connector: Arc<CoordinatorConnector>, registry: Arc<ComponentRegistry>) -> Self {
        Self::with_timeout(connector, registry, DEFAULT_OPERATION_TIMEOUT)
    }

    /// Create a client with an explicit operation timeout
    pub fn with_timeout(
        connector: Arc<CoordinatorConnector>,
        registry: Arc<ComponentRegistry>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            registry,
            operation_timeout,
        }
    }

    /// The component registry backing address resolution
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Send one operation to one target and return its response
    pub async fn send(
        &self,
        destination: SimulatorAddress,
        operation: Operation,
    ) -> CoordinatorResult<Response> {
        self.connector
            .send(destination, operation, self.operation_timeout)
            .await
    }

    /// Broadcast to an explicit target set, merging per-target results
    ///
    /// Ordering is preserved per destination (FIFO on each agent
    /// connection) but not across destinations.
    pub async fn broadcast(
        &self,
        targets: &[SimulatorAddress],
        operation: Operation,
    ) -> CoordinatorResult<Response> {
        let sends = targets
            .iter()
            .map(|target| self.send(*target, operation.clone()));
        let mut merged = Response::new();
        for outcome in join_all(sends).await {
            merged.merge(outcome?);
        }
        Ok(merged)
    }

    /// Broadcast to every registered worker
    pub async fn send_to_all_workers(&self, operation: Operation) -> CoordinatorResult<Response> {
        let targets = self.registry.worker_addresses();
        self.broadcast(&targets, operation).await
    }

    /// Send to the designated first worker (lowest address)
    pub async fn send_to_first_worker(&self, operation: Operation) -> CoordinatorResult<Response> {
        let first = self
            .registry
            .first_worker()
            .ok_or(CoordinatorError::NoWorkers)?;
        self.send(first.address, operation).await
    }

    /// Broadcast to every registered agent
    pub async fn send_to_all_agents(&self, operation: Operation) -> CoordinatorResult<Response> {
        let targets: Vec<SimulatorAddress> = self
            .registry
            .agents()
            .iter()
            .map(|agent| agent.address)
            .collect();
        self.broadcast(&targets, operation).await
    }

    /// Register the suite with every agent; idempotent on the agent side
    pub async fn init_test_suite(&self, suite: &TestSuite) -> CoordinatorResult<()> {
        let response = self
            .send_to_all_agents(Operation::InitTestSuite {
                suite: suite.clone(),
            })
            .await?;
        ensure_success(&response)
    }

    /// Launch workers on one agent and register them
    pub async fn create_workers(
        &self,
        agent: SimulatorAddress,
        worker_type: WorkerType,
        count: usize,
    ) -> CoordinatorResult<usize> {
        if count == 0 {
            return Ok(0);
        }
        let settings = vec![
            match worker_type {
                WorkerType::Member => WorkerSettings::member(),
                WorkerType::Client => WorkerSettings::client(),
            };
            count
        ];
        let version_spec = settings[0].version_spec.clone();
        let response = self
            .send(agent, Operation::CreateWorkers { settings })
            .await?;
        ensure_success(&response)?;

        let mut created = 0;
        for (address, _) in response.entries.iter() {
            self.registry.add_worker(WorkerData {
                address: *address,
                worker_type,
                worker_id: address.to_string(),
                version_spec: version_spec.clone(),
                grid_address: None,
            });
            created += 1;
        }
        Ok(created)
    }

    /// Ask every agent to terminate its workers
    ///
    /// With `wait`, also waits until the failure container has seen a
    /// terminal report from every registered worker, up to the timeout.
    /// Returns the workers that did not confirm shutdown in time.
    pub async fn terminate_workers(
        &self,
        wait: bool,
        failures: &FailureContainer,
        shutdown_timeout: Duration,
    ) -> CoordinatorResult<Vec<WorkerData>> {
        info!("Terminating workers");
        let response = self.send_to_all_agents(Operation::TerminateWorkers).await?;
        if let Some((address, response_type)) = response.first_error() {
            warn!(%address, %response_type, "Agent did not accept termination");
        }

        if !wait {
            return Ok(Vec::new());
        }

        let expected = self.registry.worker_count();
        let all_done = failures
            .wait_for_worker_shutdown(expected, shutdown_timeout)
            .await;
        if all_done {
            return Ok(Vec::new());
        }

        let unfinished = self.registry.missing_workers(&failures.finished_workers());
        for worker in &unfinished {
            warn!(worker = %worker.address, "Worker did not confirm shutdown");
        }
        Ok(unfinished)
    }

    /// Best-effort log fan-out; failures are ignored
    pub async fn log_on_all_agents(&self, message: &str) {
        let outcome = self
            .send_to_all_agents(Operation::Log {
                level: LogLevel::Info,
                message: message.to_string(),
            })
            .await;
        if let Err(err) = outcome {
            warn!(error = %err, "Could not fan out log message");
        }
    }
}

/// Surface the first non-success entry as an error
pub fn ensure_success(response: &Response) -> CoordinatorResult<()> {
    match response.first_error() {
        None => Ok(()),
        Some((address, response_type)) => Err(CoordinatorError::Remote {
            address,
            response_type,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::spawn_failure_dispatcher;
    use crate::listeners::TestPhaseListeners;
    use crate::performance::PerformanceStatsContainer;
    use crate::testutil::{spawn_fake_agent, FakeAgentBehavior, FakeAgentLog};
    use gridbench_core::failure::{FailureKind, FailureOperation};
    use gridbench_core::phase::TestPhase;
    use std::collections::HashSet;
    use tokio_util::sync::CancellationToken;

    struct Stack {
        remote: RemoteClient,
        connector: Arc<CoordinatorConnector>,
        failures: Arc<FailureContainer>,
        registry: Arc<ComponentRegistry>,
        cancel: CancellationToken,
    }

    fn stack(timeout: Duration) -> Stack {
        let failures = Arc::new(FailureContainer::new());
        let listeners = Arc::new(TestPhaseListeners::new());
        let performance = Arc::new(PerformanceStatsContainer::new());
        let registry = Arc::new(ComponentRegistry::new());
        let cancel = CancellationToken::new();
        let connector = CoordinatorConnector::new(
            Arc::clone(&failures),
            listeners,
            performance,
            cancel.clone(),
        );
        let remote = RemoteClient::with_timeout(
            Arc::clone(&connector),
            Arc::clone(&registry),
            timeout,
        );
        Stack {
            remote,
            connector,
            failures,
            registry,
            cancel,
        }
    }

    fn attach_fake_agent(
        stack: &Stack,
        agent_index: u32,
        behavior: FakeAgentBehavior,
    ) -> Arc<FakeAgentLog> {
        let (coordinator_side, agent_side) = tokio::io::duplex(256 * 1024);
        stack
            .registry
            .add_agent(format!("10.0.0.{agent_index}"), format!("192.168.0.{agent_index}"));
        stack.connector.attach(agent_index, coordinator_side);
        spawn_fake_agent(agent_side, agent_index, behavior)
    }

    fn register_worker(stack: &Stack, agent: u32, index: u32) -> SimulatorAddress {
        let address = SimulatorAddress::worker(agent, index);
        stack.registry.add_worker(WorkerData {
            address,
            worker_type: WorkerType::Member,
            worker_id: address.to_string(),
            version_spec: "default".into(),
            grid_address: None,
        });
        address
    }

    #[tokio::test]
    async fn test_broadcast_collects_all_targets() {
        let stack = stack(Duration::from_secs(5));
        let behavior = FakeAgentBehavior {
            workers: vec![SimulatorAddress::worker(1, 1), SimulatorAddress::worker(1, 2)],
            ..Default::default()
        };
        let log = attach_fake_agent(&stack, 1, behavior);
        register_worker(&stack, 1, 1);
        register_worker(&stack, 1, 2);

        let response = stack
            .remote
            .send_to_all_workers(Operation::Ping)
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.len(), 2);
        assert_eq!(log.count_of("ping"), 2);
    }

    #[tokio::test]
    async fn test_first_worker_is_lowest_address() {
        let stack = stack(Duration::from_secs(5));
        let log = attach_fake_agent(&stack, 1, FakeAgentBehavior::default());
        register_worker(&stack, 1, 2);
        register_worker(&stack, 1, 1);

        stack
            .remote
            .send_to_first_worker(Operation::Ping)
            .await
            .unwrap();

        let destinations = log.destinations();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].0, SimulatorAddress::worker(1, 1));
    }

    #[tokio::test]
    async fn test_timeout_yields_failure_timeout_entry() {
        let stack = stack(Duration::from_millis(100));
        let behavior = FakeAgentBehavior {
            silent_ops: HashSet::from(["ping"]),
            ..Default::default()
        };
        attach_fake_agent(&stack, 1, behavior);
        let worker = register_worker(&stack, 1, 1);

        let response = stack
            .remote
            .send_to_all_workers(Operation::Ping)
            .await
            .unwrap();
        let (address, response_type) = response.first_error().unwrap();
        assert_eq!(address, worker);
        assert_eq!(response_type, ResponseType::FailureTimeout);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_an_error() {
        let stack = stack(Duration::from_secs(1));
        let err = stack
            .remote
            .send(SimulatorAddress::agent(9), Operation::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_terminal_failure_unblocks_pending_operation() {
        let stack = stack(Duration::from_secs(30));
        let behavior = FakeAgentBehavior {
            silent_ops: HashSet::from(["startPhase"]),
            ..Default::default()
        };
        attach_fake_agent(&stack, 1, behavior);
        let worker = register_worker(&stack, 1, 1);

        spawn_failure_dispatcher(
            &stack.failures,
            Arc::clone(&stack.connector),
            Arc::clone(&stack.registry),
            stack.cancel.clone(),
        );

        let send = {
            let remote = &stack.remote;
            remote.send(
                worker,
                Operation::StartPhase {
                    test_id: "map".into(),
                    test_index: 1,
                    phase: TestPhase::Setup,
                },
            )
        };
        let inject = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stack.failures.add(FailureOperation {
                message: "killed".into(),
                kind: FailureKind::WorkerExit,
                worker_address: worker,
                agent_public_address: "10.0.0.1".into(),
                grid_address: None,
                worker_id: worker.to_string(),
                test_id: None,
                suite_id: "suite".into(),
                cause: None,
            });
        };

        let (response, ()) = tokio::join!(send, inject);
        let response = response.unwrap();
        let (address, response_type) = response.first_error().unwrap();
        assert_eq!(address, worker);
        assert_eq!(response_type, ResponseType::UnblockedByFailure);
        // The dead worker is dropped from the registry as well.
        assert_eq!(stack.registry.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_create_workers_registers_responses() {
        let stack = stack(Duration::from_secs(5));
        let behavior = FakeAgentBehavior {
            workers: vec![SimulatorAddress::worker(1, 1), SimulatorAddress::worker(1, 2)],
            ..Default::default()
        };
        attach_fake_agent(&stack, 1, behavior);

        let created = stack
            .remote
            .create_workers(SimulatorAddress::agent(1), WorkerType::Member, 2)
            .await
            .unwrap();
        assert_eq!(created, 2);
        assert_eq!(stack.registry.worker_count(), 2);
        assert_eq!(
            stack.registry.first_worker().unwrap().address,
            SimulatorAddress::worker(1, 1)
        );
    }

    #[tokio::test]
    async fn test_terminate_workers_waits_for_finished_set() {
        let stack = stack(Duration::from_secs(5));
        attach_fake_agent(&stack, 1, FakeAgentBehavior::default());
        let worker = register_worker(&stack, 1, 1);

        let failures = Arc::clone(&stack.failures);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            failures.add(FailureOperation {
                message: "done".into(),
                kind: FailureKind::WorkerFinishedNormal,
                worker_address: worker,
                agent_public_address: "10.0.0.1".into(),
                grid_address: None,
                worker_id: worker.to_string(),
                test_id: None,
                suite_id: "suite".into(),
                cause: None,
            });
        });

        let unfinished = stack
            .remote
            .terminate_workers(true, &stack.failures, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(unfinished.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_workers_reports_stragglers() {
        let stack = stack(Duration::from_secs(5));
        attach_fake_agent(&stack, 1, FakeAgentBehavior::default());
        let worker = register_worker(&stack, 1, 1);

        let unfinished = stack
            .remote
            .terminate_workers(true, &stack.failures, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].address, worker);
    }
}
