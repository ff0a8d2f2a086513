//! Error types for the agent daemon

use thiserror::Error;

use gridbench_core::error::ProtocolError;

/// Errors raised by the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Wire protocol failure on the coordinator connection
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A worker process could not be launched
    #[error("could not launch worker: {0}")]
    Launch(String),

    /// No worker with the given index is registered
    #[error("worker {0} not found")]
    WorkerNotFound(u32),

    /// IO error (sockets, worker homes, artifacts)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for agent operations
pub type AgentResult<T> = std::result::Result<T, AgentError>;
