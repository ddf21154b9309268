//! Errors from the wire protocol layer.

use nodelink_types::{NodeLinkError, ResultCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    /// The remote side answered the handshake with an explicit refusal.
    #[error("Handshake refused by remote node ({code}): {reason}")]
    HandshakeRefused { code: ResultCode, reason: String },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Channel {0} is not established")]
    ChannelNotEstablished(String),
    #[error("No transport registered for id '{0}'")]
    UnknownTransport(String),
    #[error("Node id collision: {0}")]
    NodeIdCollision(String),
    #[error("Shutdown in progress")]
    ShuttingDown,
    #[error(transparent)]
    Types(#[from] NodeLinkError),
}

impl WireError {
    /// Whether retrying the same connection attempt can possibly succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            WireError::VersionMismatch { .. }
                | WireError::HandshakeRefused {
                    code: ResultCode::IncompatibleProtocolVersion,
                    ..
                }
                | WireError::UnknownTransport(_)
        )
    }
}

pub type WireResult<T> = Result<T, WireError>;
