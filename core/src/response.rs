//! Responses to operations
//!
//! Every operation is answered with a [`Response`] carrying one
//! [`ResponseType`] per addressed target. A broadcast to five workers
//! produces one response with five entries; the first non-success entry
//! in address order is the canonical error.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::SimulatorAddress;

/// Outcome of an operation on a single target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    /// The operation executed
    Success,
    /// The destination named a coordinator that is not there
    FailureCoordinatorNotFound,
    /// The destination named an agent that is not connected
    FailureAgentNotFound,
    /// The destination named a worker that is not registered
    FailureWorkerNotFound,
    /// No response arrived within the deadline
    FailureTimeout,
    /// The remote side raised while executing the operation
    ExceptionDuringOperationExecution,
    /// The target died while the operation was pending
    UnblockedByFailure,
}

impl ResponseType {
    /// Whether this entry reports success
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseType::Success)
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseType::Success => "SUCCESS",
            ResponseType::FailureCoordinatorNotFound => "FAILURE_COORDINATOR_NOT_FOUND",
            ResponseType::FailureAgentNotFound => "FAILURE_AGENT_NOT_FOUND",
            ResponseType::FailureWorkerNotFound => "FAILURE_WORKER_NOT_FOUND",
            ResponseType::FailureTimeout => "FAILURE_TIMEOUT",
            ResponseType::ExceptionDuringOperationExecution => {
                "EXCEPTION_DURING_OPERATION_EXECUTION"
            }
            ResponseType::UnblockedByFailure => "UNBLOCKED_BY_FAILURE",
        };
        f.write_str(name)
    }
}

/// Per-target outcomes for one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Per-target status, ordered by address
    pub entries: BTreeMap<SimulatorAddress, ResponseType>,
}

impl Response {
    /// An empty response
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// A response with a single entry
    pub fn single(target: SimulatorAddress, response_type: ResponseType) -> Self {
        let mut response = Self::new();
        response.entries.insert(target, response_type);
        response
    }

    /// Record the outcome for one target
    pub fn add(&mut self, target: SimulatorAddress, response_type: ResponseType) {
        self.entries.insert(target, response_type);
    }

    /// Merge another response's entries into this one
    pub fn merge(&mut self, other: Response) {
        self.entries.extend(other.entries);
    }

    /// The first non-success entry in address order, if any
    pub fn first_error(&self) -> Option<(SimulatorAddress, ResponseType)> {
        self.entries
            .iter()
            .find(|(_, response_type)| !response_type.is_success())
            .map(|(address, response_type)| (*address, *response_type))
    }

    /// Whether every entry reports success
    pub fn is_success(&self) -> bool {
        self.first_error().is_none()
    }

    /// Number of per-target entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the response carries no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
