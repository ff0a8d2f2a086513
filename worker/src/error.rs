//! Error types for the worker runtime

use thiserror::Error;

use gridbench_core::error::ProtocolError;

/// Errors raised by the worker runtime
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Wire protocol failure on the stdio hop
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error (artifact files, stdio)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The outbound message channel closed
    #[error("outbound channel closed")]
    OutboundClosed,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
