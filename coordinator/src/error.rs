//! Error types for the coordinator

use thiserror::Error;

use gridbench_core::address::SimulatorAddress;
use gridbench_core::error::ProtocolError;
use gridbench_core::response::ResponseType;

/// Errors raised by the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The agents file or suite descriptor is unusable
    #[error("configuration error: {0}")]
    Config(String),

    /// No agents are registered; nothing to run on
    #[error("no agents configured")]
    NoAgents,

    /// Workers failed to start; nothing to run on
    #[error("no workers available")]
    NoWorkers,

    /// An agent could not be reached at startup
    #[error("could not connect to agent {address}: {source}")]
    Connect {
        /// The agent's public address
        address: String,
        /// The underlying connect error
        source: std::io::Error,
    },

    /// An operation was addressed to an agent that is not connected
    #[error("agent {0} not connected")]
    AgentNotFound(SimulatorAddress),

    /// A remote target answered with a non-success response
    #[error("{response_type} from {address}")]
    Remote {
        /// The target that failed
        address: SimulatorAddress,
        /// Its response
        response_type: ResponseType,
    },

    /// The run was cancelled (fail-fast abort or user interrupt)
    #[error("operation cancelled")]
    Cancelled,

    /// Wire protocol failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for coordinator operations
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
