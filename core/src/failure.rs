//! Failure classification and failure reports
//!
//! Agents translate everything that can go wrong with a worker process
//! into a [`FailureOperation`] and forward it to the coordinator, where
//! the failure container classifies it as critical or tolerable per
//! suite configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::SimulatorAddress;

/// What went wrong with a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The workload raised an unhandled error (exception artifact)
    WorkerException,
    /// The worker ran out of memory
    WorkerOom,
    /// The worker stopped sending messages (heartbeat timeout)
    WorkerTimeout,
    /// The worker process exited with a nonzero code
    WorkerExit,
    /// The worker process exited cleanly while the suite was running
    WorkerFinished,
    /// The worker process exited cleanly after requested termination
    WorkerFinishedNormal,
}

impl FailureKind {
    /// Whether this kind counts as a failure at all
    ///
    /// [`FailureKind::WorkerFinishedNormal`] is informational; every
    /// other kind is a failure unless the suite tolerates it.
    pub fn is_failure(&self) -> bool {
        !matches!(self, FailureKind::WorkerFinishedNormal)
    }

    /// Whether occurrence implies the worker process is gone
    ///
    /// A terminal kind removes the worker from the registry; pending
    /// operations targeting it are unblocked. Exceptions and heartbeat
    /// timeouts leave the process alive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureKind::WorkerOom
                | FailureKind::WorkerExit
                | FailureKind::WorkerFinished
                | FailureKind::WorkerFinishedNormal
        )
    }

    /// The kind name as rendered in logs
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::WorkerException => "WORKER_EXCEPTION",
            FailureKind::WorkerOom => "WORKER_OOM",
            FailureKind::WorkerTimeout => "WORKER_TIMEOUT",
            FailureKind::WorkerExit => "WORKER_EXIT",
            FailureKind::WorkerFinished => "WORKER_FINISHED",
            FailureKind::WorkerFinishedNormal => "WORKER_FINISHED_NORMAL",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured failure report travelling from an agent to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureOperation {
    /// Human-readable one-line summary
    pub message: String,
    /// Failure classification
    pub kind: FailureKind,
    /// Address of the affected worker
    pub worker_address: SimulatorAddress,
    /// Public address of the agent that observed the failure
    pub agent_public_address: String,
    /// Opaque address of the worker inside the target grid, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_address: Option<String>,
    /// The agent-assigned worker id string
    pub worker_id: String,
    /// Id of the test the failure is attributed to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    /// Id of the suite that was running
    pub suite_id: String,
    /// Stack trace or cause text, if captured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl FailureOperation {
    /// Render the numbered multi-line log message for this failure
    pub fn log_message(&self, failure_number: usize) -> String {
        let mut out = format!(
            "Failure #{failure_number} {} {}: {} {}",
            self.worker_id, self.worker_address, self.kind, self.message
        );
        if let Some(test_id) = &self.test_id {
            out.push_str(&format!(" (test: {test_id})"));
        }
        if let Some(cause) = &self.cause {
            out.push('\n');
            out.push_str(cause.trim_end());
        }
        out
    }
}

impl fmt::Display for FailureOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} ({}): {}",
            self.kind, self.worker_address, self.agent_public_address, self.message
        )
    }
}
