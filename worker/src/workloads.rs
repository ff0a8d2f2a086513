//! Built-in workloads
//!
//! Small workloads used by smoke runs and the integration-style tests:
//! `success` loops until stopped, `sleep` idles for a configured time,
//! `failing` raises from its run body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::info;

use gridbench_core::suite::TestCase;

use crate::workload::{TestContext, Workload, WorkloadError};

/// Factory for the `success` workload
pub(crate) fn success_workload(_case: &TestCase) -> Result<Arc<dyn Workload>, WorkloadError> {
    Ok(Arc::new(SuccessWorkload))
}

/// Factory for the `sleep` workload
pub(crate) fn sleep_workload(case: &TestCase) -> Result<Arc<dyn Workload>, WorkloadError> {
    let sleep_seconds = case.parsed_property("sleepSeconds", 1u64);
    Ok(Arc::new(SleepWorkload { sleep_seconds }))
}

/// Factory for the `failing` workload
pub(crate) fn failing_workload(_case: &TestCase) -> Result<Arc<dyn Workload>, WorkloadError> {
    Ok(Arc::new(FailingWorkload))
}

/// Runs a trivial operation loop until stopped
#[derive(Debug)]
struct SuccessWorkload;

#[async_trait]
impl Workload for SuccessWorkload {
    async fn setup(&self, ctx: &TestContext) -> Result<(), WorkloadError> {
        info!(test = ctx.test_id(), "setup");
        Ok(())
    }

    async fn run(&self, ctx: &TestContext) -> Result<(), WorkloadError> {
        while !ctx.is_stopped() {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.record_operation(started.elapsed());
        }
        Ok(())
    }

    async fn teardown(&self, ctx: &TestContext, global: bool) -> Result<(), WorkloadError> {
        info!(test = ctx.test_id(), global, "teardown");
        Ok(())
    }
}

/// Sleeps for a fixed time, or less if stopped early
#[derive(Debug)]
struct SleepWorkload {
    sleep_seconds: u64,
}

#[async_trait]
impl Workload for SleepWorkload {
    async fn run(&self, ctx: &TestContext) -> Result<(), WorkloadError> {
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.sleep_seconds)) => {}
            _ = ctx.stopped().cancelled() => {}
        }
        ctx.record_operation(started.elapsed());
        Ok(())
    }
}

/// Raises from its run body; exercises the exception artifact path
#[derive(Debug)]
struct FailingWorkload;

#[async_trait]
impl Workload for FailingWorkload {
    async fn run(&self, _ctx: &TestContext) -> Result<(), WorkloadError> {
        Err(WorkloadError::failed("This workload should fail"))
    }
}
