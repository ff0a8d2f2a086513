//! Coordinator-side directory of agents, workers, and tests
//!
//! The registry is the single source of truth for which components
//! exist in a run, keyed by their simulator addresses. All mutation
//! goes through one internal lock; readers get consistent snapshots.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::address::SimulatorAddress;
use crate::operation::WorkerType;
use crate::suite::{TestCase, TestSuite};

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentData {
    /// The agent's address (`C_A<n>`)
    pub address: SimulatorAddress,
    /// Address the coordinator dials
    pub public_address: String,
    /// Address workers use inside the cluster network
    pub private_address: String,
}

impl AgentData {
    /// Create agent data for the given 1-based index
    pub fn new(address_index: u32, public_address: String, private_address: String) -> Self {
        Self {
            address: SimulatorAddress::agent(address_index),
            public_address,
            private_address,
        }
    }

    /// The agent's 1-based index
    pub fn address_index(&self) -> u32 {
        self.address.agent_index().unwrap_or(0)
    }
}

/// A registered worker, as seen from the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerData {
    /// The worker's address (`C_A<n>_W<m>`)
    pub address: SimulatorAddress,
    /// Member or client
    pub worker_type: WorkerType,
    /// The agent-assigned worker id string
    pub worker_id: String,
    /// Version spec of the grid binary the worker runs
    pub version_spec: String,
    /// Opaque address of the worker inside the target grid, once known
    pub grid_address: Option<String>,
}

/// A registered test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestData {
    /// 1-based registry index, stable for the run
    pub test_index: u32,
    /// The test definition
    pub case: TestCase,
    /// Id of the owning suite
    pub suite_id: String,
}

#[derive(Debug, Default)]
struct Inner {
    agents: Vec<AgentData>,
    workers: Vec<WorkerData>,
    tests: Vec<TestData>,
}

/// Hierarchical in-memory component store
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    inner: Mutex<Inner>,
}

impl ComponentRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent; indexes are assigned in insertion order
    pub fn add_agent(&self, public_address: String, private_address: String) -> AgentData {
        let mut inner = self.inner.lock().expect("registry lock");
        let index = inner.agents.len() as u32 + 1;
        let agent = AgentData::new(index, public_address, private_address);
        inner.agents.push(agent.clone());
        agent
    }

    /// Snapshot of all agents in index order
    pub fn agents(&self) -> Vec<AgentData> {
        self.inner.lock().expect("registry lock").agents.clone()
    }

    /// Number of registered agents
    pub fn agent_count(&self) -> usize {
        self.inner.lock().expect("registry lock").agents.len()
    }

    /// Register a worker under its agent
    pub fn add_worker(&self, worker: WorkerData) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.workers.push(worker);
        inner.workers.sort_by_key(|worker| worker.address);
    }

    /// Remove a worker; returns the removed entry if it was present
    pub fn remove_worker(&self, address: SimulatorAddress) -> Option<WorkerData> {
        let mut inner = self.inner.lock().expect("registry lock");
        let position = inner
            .workers
            .iter()
            .position(|worker| worker.address == address)?;
        Some(inner.workers.remove(position))
    }

    /// Snapshot of all workers in `(agent, worker)` order
    pub fn workers(&self) -> Vec<WorkerData> {
        self.inner.lock().expect("registry lock").workers.clone()
    }

    /// Snapshot of all worker addresses in `(agent, worker)` order
    pub fn worker_addresses(&self) -> Vec<SimulatorAddress> {
        self.inner
            .lock()
            .expect("registry lock")
            .workers
            .iter()
            .map(|worker| worker.address)
            .collect()
    }

    /// Number of registered workers
    pub fn worker_count(&self) -> usize {
        self.inner.lock().expect("registry lock").workers.len()
    }

    /// The first `target_count` workers of the given type, in address order
    pub fn get_workers(&self, worker_type: WorkerType, target_count: usize) -> Vec<WorkerData> {
        self.inner
            .lock()
            .expect("registry lock")
            .workers
            .iter()
            .filter(|worker| worker.worker_type == worker_type)
            .take(target_count)
            .cloned()
            .collect()
    }

    /// The designated first worker: lowest `(agent, worker)` address
    pub fn first_worker(&self) -> Option<WorkerData> {
        self.inner
            .lock()
            .expect("registry lock")
            .workers
            .first()
            .cloned()
    }

    /// Drop every worker (used when restarting the fleet)
    pub fn clear_workers(&self) {
        self.inner.lock().expect("registry lock").workers.clear();
    }

    /// Workers not contained in the given finished set
    pub fn missing_workers(&self, finished: &BTreeSet<SimulatorAddress>) -> Vec<WorkerData> {
        self.inner
            .lock()
            .expect("registry lock")
            .workers
            .iter()
            .filter(|worker| !finished.contains(&worker.address))
            .cloned()
            .collect()
    }

    /// Register every case of a suite; indexes are assigned in suite order
    pub fn add_tests(&self, suite: &TestSuite) -> Vec<TestData> {
        let mut inner = self.inner.lock().expect("registry lock");
        let mut added = Vec::with_capacity(suite.cases.len());
        for case in &suite.cases {
            let test = TestData {
                test_index: inner.tests.len() as u32 + 1,
                case: case.clone(),
                suite_id: suite.id.clone(),
            };
            inner.tests.push(test.clone());
            added.push(test);
        }
        added
    }

    /// Snapshot of all registered tests
    pub fn tests(&self) -> Vec<TestData> {
        self.inner.lock().expect("registry lock").tests.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::TestSuite;

    fn worker(agent: u32, index: u32, worker_type: WorkerType) -> WorkerData {
        WorkerData {
            address: SimulatorAddress::worker(agent, index),
            worker_type,
            worker_id: format!("C_A{agent}_W{index}"),
            version_spec: "default".into(),
            grid_address: None,
        }
    }

    #[test]
    fn test_agent_indexes_assigned_in_order() {
        let registry = ComponentRegistry::new();
        let first = registry.add_agent("10.0.0.1".into(), "192.168.0.1".into());
        let second = registry.add_agent("10.0.0.2".into(), "192.168.0.2".into());

        assert_eq!(first.address, SimulatorAddress::agent(1));
        assert_eq!(second.address_index(), 2);
        assert_eq!(registry.agent_count(), 2);
    }

    #[test]
    fn test_workers_kept_in_address_order() {
        let registry = ComponentRegistry::new();
        registry.add_worker(worker(2, 1, WorkerType::Member));
        registry.add_worker(worker(1, 2, WorkerType::Client));
        registry.add_worker(worker(1, 1, WorkerType::Member));

        let addresses = registry.worker_addresses();
        assert_eq!(
            addresses,
            vec![
                SimulatorAddress::worker(1, 1),
                SimulatorAddress::worker(1, 2),
                SimulatorAddress::worker(2, 1),
            ]
        );
        assert_eq!(
            registry.first_worker().unwrap().address,
            SimulatorAddress::worker(1, 1)
        );
    }

    #[test]
    fn test_get_workers_filters_by_type() {
        let registry = ComponentRegistry::new();
        registry.add_worker(worker(1, 1, WorkerType::Member));
        registry.add_worker(worker(1, 2, WorkerType::Client));
        registry.add_worker(worker(2, 1, WorkerType::Member));

        let members = registry.get_workers(WorkerType::Member, 10);
        assert_eq!(members.len(), 2);
        assert!(members
            .iter()
            .all(|worker| worker.worker_type == WorkerType::Member));

        let one_client = registry.get_workers(WorkerType::Client, 1);
        assert_eq!(one_client.len(), 1);
        assert_eq!(one_client[0].address, SimulatorAddress::worker(1, 2));
    }

    #[test]
    fn test_remove_worker() {
        let registry = ComponentRegistry::new();
        registry.add_worker(worker(1, 1, WorkerType::Member));
        registry.add_worker(worker(1, 2, WorkerType::Member));

        let removed = registry.remove_worker(SimulatorAddress::worker(1, 1));
        assert!(removed.is_some());
        assert_eq!(registry.worker_count(), 1);
        assert!(registry
            .remove_worker(SimulatorAddress::worker(1, 1))
            .is_none());
    }

    #[test]
    fn test_missing_workers() {
        let registry = ComponentRegistry::new();
        registry.add_worker(worker(1, 1, WorkerType::Member));
        registry.add_worker(worker(1, 2, WorkerType::Member));

        let finished = BTreeSet::from([SimulatorAddress::worker(1, 1)]);
        let missing = registry.missing_workers(&finished);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].address, SimulatorAddress::worker(1, 2));
    }

    #[test]
    fn test_add_tests_assigns_indexes() {
        let registry = ComponentRegistry::new();
        let mut suite = TestSuite::with_id("suite");
        suite.add_test(TestCase::new("first"));
        suite.add_test(TestCase::new("second"));

        let tests = registry.add_tests(&suite);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].test_index, 1);
        assert_eq!(tests[1].test_index, 2);
        assert_eq!(registry.tests()[1].case.id, "second");
    }
}
