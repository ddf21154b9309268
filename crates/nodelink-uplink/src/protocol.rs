//! Uplink protocol constants, message types and error codes.

use crate::error::{UplinkError, UplinkResult};
use std::fmt;
use std::time::Duration;

/// High-level protocol version; client and server must match exactly.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Bytes sent by the client before anything else.
pub const HANDSHAKE_HEADER: &[u8; 8] = b"NLUPLINK";

/// Control channel present in every session.
pub const DEFAULT_CHANNEL_ID: i64 = 0;

/// Channel id of failure responses that never got a real channel.
pub const UNDEFINED_CHANNEL_ID: i64 = -1;

pub const ACCOUNT_NAME_SIGNIFICANT_CHARACTERS: usize = 16;
pub const SESSION_QUALIFIER_SIGNIFICANT_CHARACTERS: usize = 8;
pub const DESTINATION_ID_PREFIX_PADDING_CHARACTER: char = '#';
pub const DESTINATION_ID_PREFIX_LENGTH: usize =
    ACCOUNT_NAME_SIGNIFICANT_CHARACTERS + SESSION_QUALIFIER_SIGNIFICANT_CHARACTERS;
pub const SESSION_QUALIFIER_DEFAULT: &str = "default";

pub const MAX_MESSAGE_BLOCK_DATA_LENGTH: usize = 256 * 1024;

pub const HANDSHAKE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHANNEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys of the handshake map.
pub mod handshake_keys {
    /// Version offered by the client.
    pub const PROTOCOL_VERSION_OFFER: &str = "protocolVersionOffer";
    /// Version the server settled on.
    pub const PROTOCOL_VERSION: &str = "protocolVersion";
    pub const CLIENT_VERSION_INFO: &str = "clientVersion";
    pub const ACCOUNT_NAME: &str = "accountName";
    pub const SESSION_QUALIFIER: &str = "sessionQualifier";
    pub const ASSIGNED_NAMESPACE_ID: &str = "assignedNamespace";

    pub const SIMULATE_HANDSHAKE_FAILURE: &str = "simulateHandshakeFailure";
    pub const SIMULATE_REFUSED_CONNECTION: &str = "simulateRefusedConnection";
    pub const SIMULATE_HANDSHAKE_RESPONSE_DELAY: &str = "simulateHandshakeResponseDelay";
}

/// Channel types offered to clients.
pub mod channel_types {
    pub const TOOL_EXECUTION: &str = "exec";
    pub const DOCUMENTATION: &str = "docs";
}

macro_rules! message_types {
    ($($variant:ident = $code:literal),+ $(,)?) => {
        /// Type tag of a [`MessageBlock`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant),+
        }

        impl MessageType {
            pub fn code(self) -> u8 {
                match self {
                    $(MessageType::$variant => $code),+
                }
            }

            pub fn from_code(code: u8) -> UplinkResult<Self> {
                match code {
                    $($code => Ok(MessageType::$variant),)+
                    other => Err(UplinkError::protocol(format!("Unknown message type code {other}"))),
                }
            }
        }
    };
}

message_types! {
    Handshake = 1,
    Goodbye = 2,
    Heartbeat = 3,
    HeartbeatResponse = 4,
    ToolDescriptorListUpdate = 10,
    ChannelInit = 11,
    ChannelInitResponse = 12,
    ChannelClose = 13,
    ToolExecutionRequest = 20,
    ToolExecutionRequestResponse = 21,
    ToolExecutionEvents = 22,
    ToolExecutionFinished = 23,
    ToolCancellationRequest = 24,
    ToolDocumentationRequest = 30,
    ToolDocumentationResponse = 31,
    FileHeader = 40,
    FileContent = 41,
    Test = 99,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One typed unit of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub message_type: MessageType,
    pub data: Vec<u8>,
}

impl MessageBlock {
    pub fn new(message_type: MessageType, data: Vec<u8>) -> UplinkResult<Self> {
        if data.len() > MAX_MESSAGE_BLOCK_DATA_LENGTH {
            return Err(UplinkError::protocol(format!(
                "Message block data of {} bytes exceeds the maximum of {MAX_MESSAGE_BLOCK_DATA_LENGTH}",
                data.len()
            )));
        }
        Ok(Self { message_type, data })
    }

    /// A block without payload.
    pub fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            data: Vec::new(),
        }
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Error categories carried in error goodbye messages as `E<code>: <message>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkErrorType {
    ProtocolVersionMismatch,
    InvalidHandshakeData,
    ClientNamespaceCollision,
    InternalServerError,
}

impl UplinkErrorType {
    pub fn code(self) -> &'static str {
        match self {
            UplinkErrorType::ProtocolVersionMismatch => "E1",
            UplinkErrorType::InvalidHandshakeData => "E2",
            UplinkErrorType::ClientNamespaceCollision => "E3",
            UplinkErrorType::InternalServerError => "E99",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "E1" => Some(UplinkErrorType::ProtocolVersionMismatch),
            "E2" => Some(UplinkErrorType::InvalidHandshakeData),
            "E3" => Some(UplinkErrorType::ClientNamespaceCollision),
            "E99" => Some(UplinkErrorType::InternalServerError),
            _ => None,
        }
    }

    pub fn wrap(self, message: &str) -> String {
        format!("{}: {message}", self.code())
    }

    /// Split a wrapped message into its type and text. Messages without a
    /// known code are reported as internal errors and kept unchanged.
    pub fn unwrap_message(wrapped: &str) -> (UplinkErrorType, String) {
        if let Some((code, rest)) = wrapped.split_once(": ") {
            if let Some(error_type) = UplinkErrorType::from_code(code) {
                return (error_type, rest.to_string());
            }
        }
        (UplinkErrorType::InternalServerError, wrapped.to_string())
    }
}

/// Text used when an error goodbye arrives without a message.
pub const MISSING_ERROR_MESSAGE: &str = "E99: <no error message available>";

/// Lifecycle of one uplink session, shared by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkSessionState {
    ClientHandshakeRequestReady,
    Active,
    SessionRefusedOrHandshakeError,
    PartiallyClosedByLocal,
    PartiallyClosedByRemote,
    CleanShutdown,
    Terminated,
}

impl UplinkSessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UplinkSessionState::SessionRefusedOrHandshakeError
                | UplinkSessionState::CleanShutdown
                | UplinkSessionState::Terminated
        )
    }
}

impl fmt::Display for UplinkSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UplinkSessionState::ClientHandshakeRequestReady => "CLIENT_HANDSHAKE_REQUEST_READY",
            UplinkSessionState::Active => "ACTIVE",
            UplinkSessionState::SessionRefusedOrHandshakeError => {
                "SESSION_REFUSED_OR_HANDSHAKE_ERROR"
            }
            UplinkSessionState::PartiallyClosedByLocal => "PARTIALLY_CLOSED_BY_LOCAL",
            UplinkSessionState::PartiallyClosedByRemote => "PARTIALLY_CLOSED_BY_REMOTE",
            UplinkSessionState::CleanShutdown => "CLEAN_SHUTDOWN",
            UplinkSessionState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes_round_trip() {
        for t in [
            MessageType::Handshake,
            MessageType::ChannelInit,
            MessageType::FileContent,
            MessageType::Test,
        ] {
            assert_eq!(MessageType::from_code(t.code()).unwrap(), t);
        }
        assert!(MessageType::from_code(200).is_err());
    }

    #[test]
    fn test_error_wrapping() {
        let wrapped = UplinkErrorType::ClientNamespaceCollision.wrap("in use");
        assert_eq!(wrapped, "E3: in use");
        assert_eq!(
            UplinkErrorType::unwrap_message(&wrapped),
            (UplinkErrorType::ClientNamespaceCollision, "in use".to_string())
        );
        assert_eq!(
            UplinkErrorType::unwrap_message(MISSING_ERROR_MESSAGE).0,
            UplinkErrorType::InternalServerError
        );
        assert_eq!(
            UplinkErrorType::unwrap_message("plain text"),
            (UplinkErrorType::InternalServerError, "plain text".to_string())
        );
    }

    #[test]
    fn test_block_size_limit() {
        assert!(MessageBlock::new(MessageType::Test, vec![0; MAX_MESSAGE_BLOCK_DATA_LENGTH]).is_ok());
        assert!(
            MessageBlock::new(MessageType::Test, vec![0; MAX_MESSAGE_BLOCK_DATA_LENGTH + 1]).is_err()
        );
    }

    #[test]
    fn test_prefix_length() {
        assert_eq!(DESTINATION_ID_PREFIX_LENGTH, 24);
        assert_eq!(HANDSHAKE_HEADER.len(), 8);
    }
}
