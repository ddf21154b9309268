//! Shared error types for the nodelink crates.

use thiserror::Error;

/// Top-level error type shared across the communication layers.
#[derive(Error, Debug)]
pub enum NodeLinkError {
    /// A node id string could not be parsed.
    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    /// A contact point string could not be parsed.
    #[error("Invalid contact point: {0}")]
    InvalidContactPoint(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The component is in an invalid state for the requested operation.
    #[error("Invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The current state.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// Timed out waiting for something to happen.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The component is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for NodeLinkError {
    fn from(e: serde_json::Error) -> Self {
        NodeLinkError::Serialization(e.to_string())
    }
}

/// Alias for Result with NodeLinkError.
pub type NodeLinkResult<T> = Result<T, NodeLinkError>;
