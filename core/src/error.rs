//! Error types for gridbench-core

use thiserror::Error;

/// Errors raised by the protocol layer
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A wire frame exceeded the maximum allowed size
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Declared payload size
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// A message could not be serialized or deserialized
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A simulator address string was malformed
    #[error("invalid simulator address '{0}'")]
    InvalidAddress(String),

    /// The peer closed the connection mid-frame
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// IO error on the underlying transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
