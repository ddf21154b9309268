//! Wire protocol frames.
//!
//! All communication between nodes uses JSON-framed messages over a byte
//! stream. Each message is prefixed with a 4-byte big-endian length header.
//! One physical connection carries the handshake, then requests and
//! responses of both directions, and finally an optional goodbye.

use crate::error::WireError;
use crate::transport::MAX_MESSAGE_SIZE;

use nodelink_types::{InitialNodeInformation, NetworkRequest, NetworkResponse, ResultCode};
use serde::{Deserialize, Serialize};

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique frame ID.
    pub id: String,
    /// Frame variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// Wrap `kind` with a fresh frame id.
    pub fn new(kind: WireMessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
        }
    }
}

/// The different kinds of wire frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// First frame sent by the connecting side.
    #[serde(rename = "handshake")]
    Handshake(Handshake),
    /// Accepting answer to a handshake.
    #[serde(rename = "handshake_ack")]
    HandshakeAck(HandshakeAck),
    /// Refusing answer to a handshake; the connection is closed afterwards.
    #[serde(rename = "handshake_refused")]
    HandshakeRefused {
        result_code: ResultCode,
        reason: String,
    },
    /// A routed request.
    #[serde(rename = "request")]
    Request(NetworkRequest),
    /// The response to a previously received request.
    #[serde(rename = "response")]
    Response(NetworkResponse),
    /// Graceful close of the channel pair.
    #[serde(rename = "goodbye")]
    Goodbye,
}

/// Handshake sent by the connecting node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub node: InitialNodeInformation,
    pub protocol_version: u32,
    /// Channel id assigned by the connecting side.
    pub channel_id: String,
    /// Whether the accepting side should open its own outgoing channel
    /// over the same connection.
    pub duplex: bool,
    /// Random nonce for HMAC authentication.
    #[serde(default)]
    pub nonce: String,
    /// HMAC-SHA256(shared_secret, nonce + node_id).
    #[serde(default)]
    pub auth_hmac: String,
}

/// Handshake acknowledgement sent by the accepting node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub node: InitialNodeInformation,
    pub protocol_version: u32,
    /// Channel id assigned by the accepting side for the same connection.
    pub channel_id: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub auth_hmac: String,
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 3;

/// Older versions that are still understood by this implementation.
pub const LEGACY_COMPATIBLE_VERSIONS: &[u32] = &[2];

/// Whether a remote protocol version can talk to this implementation.
pub fn is_compatible_version(remote: u32) -> bool {
    remote == PROTOCOL_VERSION || LEGACY_COMPATIBLE_VERSIONS.contains(&remote)
}

/// A complete frame: big-endian `u32` body length, then the JSON body.
///
/// Bodies over [`MAX_MESSAGE_SIZE`] are rejected here, so the peer never
/// sees a frame it would have to drop the connection for.
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: u32::try_from(body.len()).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend(body);
    Ok(frame)
}

pub fn frame_length(prefix: [u8; 4]) -> usize {
    u32::from_be_bytes(prefix) as usize
}

pub fn decode_frame_body(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::message::message_type;
    use nodelink_types::InstanceNodeSessionId;

    fn node(name: &str) -> InitialNodeInformation {
        InitialNodeInformation::new(InstanceNodeSessionId::new(name, "s1"), name)
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let msg = WireMessage::new(WireMessageKind::Goodbye);
        let frame = encode_frame(&msg).unwrap();
        let len = frame_length([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len, frame.len() - 4);
        let decoded = decode_frame_body(&frame[4..]).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert!(matches!(decoded.kind, WireMessageKind::Goodbye));
    }

    #[test]
    fn test_oversized_body_is_not_encoded() {
        let id = InstanceNodeSessionId::new("a", "1");
        let request = NetworkRequest::new(
            message_type::TEST,
            vec![7u8; MAX_MESSAGE_SIZE as usize],
            id.clone(),
            id,
        );
        let msg = WireMessage::new(WireMessageKind::Request(request));
        match encode_frame(&msg) {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_serialization() {
        let msg = WireMessage {
            id: "hs-1".to_string(),
            kind: WireMessageKind::Handshake(Handshake {
                node: node("alpha"),
                protocol_version: PROTOCOL_VERSION,
                channel_id: "alpha-1".to_string(),
                duplex: true,
                nonce: String::new(),
                auth_hmac: String::new(),
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("alpha-1"));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            WireMessageKind::Handshake(hs) => {
                assert!(hs.duplex);
                assert_eq!(hs.node.display_name, "alpha");
            }
            other => panic!("Expected Handshake, got {other:?}"),
        }
    }

    #[test]
    fn test_request_frame_keeps_body() {
        let request = NetworkRequest::new(
            message_type::TEST,
            b"payload".to_vec(),
            InstanceNodeSessionId::new("a", "1"),
            InstanceNodeSessionId::new("b", "2"),
        );
        let msg = WireMessage::new(WireMessageKind::Request(request.clone()));
        let frame = encode_frame(&msg).unwrap();
        match decode_frame_body(&frame[4..]).unwrap().kind {
            WireMessageKind::Request(decoded) => assert_eq!(decoded, request),
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_refusal_frame() {
        let msg = WireMessage::new(WireMessageKind::HandshakeRefused {
            result_code: ResultCode::IncompatibleProtocolVersion,
            reason: "expected 3, got 1".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("INCOMPATIBLE_PROTOCOL_VERSION"));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            decoded.kind,
            WireMessageKind::HandshakeRefused {
                result_code: ResultCode::IncompatibleProtocolVersion,
                ..
            }
        ));
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible_version(PROTOCOL_VERSION));
        assert!(is_compatible_version(2));
        assert!(!is_compatible_version(1));
        assert!(!is_compatible_version(PROTOCOL_VERSION + 1));
    }
}
