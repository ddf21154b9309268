//! Errors from the uplink layer.

use crate::protocol::UplinkErrorType;
use nodelink_types::NodeLinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The peer violated the framing or message rules.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The server refused the session during the handshake.
    #[error("Connection refused ({}): {message}", .error_type.code())]
    Refused {
        error_type: UplinkErrorType,
        message: String,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out: {0}")]
    Timeout(String),
    /// The relay or the destination declined a channel request.
    #[error("Channel request to '{0}' failed")]
    ChannelRequestFailed(String),
    #[error("Session is not active")]
    SessionClosed,
    #[error(transparent)]
    Types(#[from] NodeLinkError),
}

impl UplinkError {
    pub fn protocol(message: impl Into<String>) -> Self {
        UplinkError::Protocol(message.into())
    }

    /// Map a read error to `ConnectionClosed` when the peer just went away.
    pub(crate) fn from_read(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            UplinkError::ConnectionClosed
        } else {
            UplinkError::Io(e)
        }
    }
}

pub type UplinkResult<T> = Result<T, UplinkError>;
