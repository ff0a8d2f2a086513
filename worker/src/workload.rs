//! Workload trait, test context, and the workload registry
//!
//! Workloads are resolved by name: the registry is populated when the
//! worker binary is built, and `InitTest` carries the name in the test
//! case's `class` property. Unknown names fail with a well-defined
//! error instead of being loaded dynamically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use gridbench_core::suite::TestCase;

use crate::perf::OperationTracker;

/// Errors raised by workload code or workload resolution
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// No workload is registered under the requested name
    #[error("unknown workload '{0}'")]
    UnknownWorkload(String),

    /// The workload rejected its configuration
    #[error("invalid workload configuration: {0}")]
    InvalidConfig(String),

    /// The workload body failed
    #[error("{0}")]
    Failed(String),
}

impl WorkloadError {
    /// A workload body failure with the given message
    pub fn failed(message: impl Into<String>) -> Self {
        WorkloadError::Failed(message.into())
    }
}

/// Read-only context handed to every workload method
///
/// Carries the test identity, the stop signal for the RUN phase, and
/// the operation tracker feeding performance samples. Workloads never
/// hold a reference back to the runtime.
pub struct TestContext {
    test_id: String,
    test_index: u32,
    stop: CancellationToken,
    tracker: OperationTracker,
}

impl TestContext {
    /// Create a context for one test
    pub fn new(test_id: impl Into<String>, test_index: u32) -> Self {
        Self {
            test_id: test_id.into(),
            test_index,
            stop: CancellationToken::new(),
            tracker: OperationTracker::new(),
        }
    }

    /// Id of the test this context belongs to
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Registry index of the test
    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Whether the RUN phase has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Trip the stop signal
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// The stop signal, for `select!`-style workload loops
    pub fn stopped(&self) -> &CancellationToken {
        &self.stop
    }

    /// Record one completed operation with its latency
    pub fn record_operation(&self, latency: std::time::Duration) {
        self.tracker.record(latency);
    }

    /// The operation tracker backing performance reporting
    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }
}

/// A benchmark workload, driven through the test-phase lifecycle
///
/// Only `run` is mandatory; every other phase defaults to a no-op.
/// Global phases pass `global = true` on the single designated worker.
#[async_trait]
pub trait Workload: Send + Sync + std::fmt::Debug {
    /// Construct resources before any other phase
    async fn setup(&self, _ctx: &TestContext) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Warm up the workload
    async fn warmup(&self, _ctx: &TestContext, _global: bool) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// The timed benchmark body; must return promptly once
    /// [`TestContext::is_stopped`] reports true
    async fn run(&self, ctx: &TestContext) -> Result<(), WorkloadError>;

    /// Check invariants after the run
    async fn verify(&self, _ctx: &TestContext, _global: bool) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Release resources
    async fn teardown(&self, _ctx: &TestContext, _global: bool) -> Result<(), WorkloadError> {
        Ok(())
    }
}

/// Factory constructing a workload from its test-case properties
pub type WorkloadFactory = fn(&TestCase) -> Result<Arc<dyn Workload>, WorkloadError>;

/// Name-keyed workload directory, populated at build time
pub struct WorkloadRegistry {
    factories: HashMap<String, WorkloadFactory>,
}

impl WorkloadRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The registry with all built-in workloads
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("success", crate::workloads::success_workload);
        registry.register("sleep", crate::workloads::sleep_workload);
        registry.register("failing", crate::workloads::failing_workload);
        registry
    }

    /// Register a workload under a name, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, factory: WorkloadFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct the workload named by the case's `class` property
    pub fn create(&self, case: &TestCase) -> Result<Arc<dyn Workload>, WorkloadError> {
        let name = case
            .workload_class()
            .ok_or_else(|| WorkloadError::InvalidConfig("missing 'class' property".into()))?;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| WorkloadError::UnknownWorkload(name.to_string()))?;
        factory(case)
    }

    /// Registered workload names, for diagnostics
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for WorkloadRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_workload_is_a_defined_error() {
        let registry = WorkloadRegistry::builtin();
        let case = TestCase::new("t").with_property("class", "nope");
        let err = registry.create(&case).unwrap_err();
        assert!(matches!(err, WorkloadError::UnknownWorkload(name) if name == "nope"));
    }

    #[test]
    fn test_missing_class_property() {
        let registry = WorkloadRegistry::builtin();
        let err = registry.create(&TestCase::new("t")).unwrap_err();
        assert!(matches!(err, WorkloadError::InvalidConfig(_)));
    }

    #[test]
    fn test_builtin_workloads_resolve() {
        let registry = WorkloadRegistry::builtin();
        for name in ["success", "sleep", "failing"] {
            let case = TestCase::new("t").with_property("class", name);
            assert!(registry.create(&case).is_ok(), "{name}");
        }
    }

    #[tokio::test]
    async fn test_context_stop_signal() {
        let ctx = TestContext::new("map", 1);
        assert!(!ctx.is_stopped());
        ctx.stop();
        assert!(ctx.is_stopped());
        // Idempotent.
        ctx.stop();
        assert!(ctx.is_stopped());
    }
}
