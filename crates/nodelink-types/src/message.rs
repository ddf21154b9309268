//! Network request and response envelopes.
//!
//! Every [`NetworkRequest`] eventually yields exactly one [`NetworkResponse`]:
//! either the reply of the destination, a failure produced by some node on the
//! way, or a synthetic response manufactured locally (timeout, closed
//! channel). Callers never observe a request without a response.

use crate::identity::InstanceNodeSessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known message type tags.
pub mod message_type {
    /// Remote service calls.
    pub const RPC: &str = "rpc";
    /// Channel health checks.
    pub const HEALTH_CHECK: &str = "health_check";
    /// Free-form payloads used by tests and diagnostics.
    pub const TEST: &str = "test";
}

/// Metadata key holding the comma-separated list of nodes a request passed.
pub const METADATA_KEY_TRACE: &str = "trace";
/// Metadata key holding the time the destination needed to produce the response.
pub const METADATA_KEY_ELAPSED_MS: &str = "elapsed_ms";

/// Outcome of a request at the network level.
///
/// The serialized names are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    /// The sending node has no route to the destination.
    NoRouteToDestinationAtSender,
    /// A forwarding node has no further route to the destination.
    NoRouteToDestinationWhileForwarding,
    /// The request was forwarded more often than allowed.
    MaxHopCountExceeded,
    /// No response arrived within the request timeout.
    TimeoutWaitingForResponse,
    /// The outgoing channel was not established when sending.
    ChannelClosedOrBrokenBeforeSendingRequest,
    /// The channel went away while the request was in flight.
    ChannelClosedWhileWaitingForResponse,
    /// The destination has no handler for the message type.
    NoMatchingHandler,
    /// The destination handler failed.
    ExceptionAtDestination,
    /// Forwarding failed on an intermediate node.
    ExceptionWhileForwarding,
    /// The remote side speaks an incompatible protocol version.
    IncompatibleProtocolVersion,
    /// The remote side refused the handshake.
    HandshakeRefused,
    Undefined,
}

impl ResultCode {
    /// The wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::NoRouteToDestinationAtSender => "NO_ROUTE_TO_DESTINATION_AT_SENDER",
            ResultCode::NoRouteToDestinationWhileForwarding => {
                "NO_ROUTE_TO_DESTINATION_WHILE_FORWARDING"
            }
            ResultCode::MaxHopCountExceeded => "MAX_HOP_COUNT_EXCEEDED",
            ResultCode::TimeoutWaitingForResponse => "TIMEOUT_WAITING_FOR_RESPONSE",
            ResultCode::ChannelClosedOrBrokenBeforeSendingRequest => {
                "CHANNEL_CLOSED_OR_BROKEN_BEFORE_SENDING_REQUEST"
            }
            ResultCode::ChannelClosedWhileWaitingForResponse => {
                "CHANNEL_CLOSED_WHILE_WAITING_FOR_RESPONSE"
            }
            ResultCode::NoMatchingHandler => "NO_MATCHING_HANDLER",
            ResultCode::ExceptionAtDestination => "EXCEPTION_AT_DESTINATION",
            ResultCode::ExceptionWhileForwarding => "EXCEPTION_WHILE_FORWARDING",
            ResultCode::IncompatibleProtocolVersion => "INCOMPATIBLE_PROTOCOL_VERSION",
            ResultCode::HandshakeRefused => "HANDSHAKE_REFUSED",
            ResultCode::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable request travelling from `sender` to `receiver`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Unique id; responses are correlated by it.
    pub request_id: String,
    /// Message type tag selecting the handler at the destination.
    pub message_type: String,
    pub sender: InstanceNodeSessionId,
    pub receiver: InstanceNodeSessionId,
    /// Number of times this request has been forwarded.
    #[serde(default)]
    pub hop_count: u32,
    /// Serialized payload.
    #[serde(with = "crate::serde_compat", default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NetworkRequest {
    /// Create a new request with a fresh request id.
    pub fn new(
        message_type: impl Into<String>,
        body: Vec<u8>,
        sender: InstanceNodeSessionId,
        receiver: InstanceNodeSessionId,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            sender,
            receiver,
            hop_count: 0,
            body,
            metadata: BTreeMap::new(),
        }
    }

    /// Copy of this request for the next hop: same id, hop count + 1, and the
    /// forwarding node appended to the trace.
    pub fn forwarded(&self, via: &InstanceNodeSessionId) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        let trace = match next.metadata.get(METADATA_KEY_TRACE) {
            Some(existing) if !existing.is_empty() => format!("{existing},{via}"),
            _ => via.to_string(),
        };
        next.metadata.insert(METADATA_KEY_TRACE.to_string(), trace);
        next
    }

    /// Nodes this request has been forwarded through, in order.
    pub fn trace(&self) -> Vec<String> {
        self.metadata
            .get(METADATA_KEY_TRACE)
            .map(|t| t.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// The single response belonging to a [`NetworkRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub request_id: String,
    pub result_code: ResultCode,
    /// Serialized payload; empty for most failures.
    #[serde(with = "crate::serde_compat", default)]
    pub body: Vec<u8>,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NetworkResponse {
    /// A successful response carrying `body`.
    pub fn success(request: &NetworkRequest, body: Vec<u8>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            result_code: ResultCode::Success,
            body,
            error_message: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A failure response for `request_id`.
    pub fn failure(
        request_id: impl Into<String>,
        result_code: ResultCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            result_code,
            body: Vec::new(),
            error_message: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Result code plus error message, for log lines and error texts.
    pub fn failure_description(&self) -> String {
        match &self.error_message {
            Some(msg) if !msg.is_empty() => format!("{}: {}", self.result_code, msg),
            _ => self.result_code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (InstanceNodeSessionId, InstanceNodeSessionId) {
        (
            InstanceNodeSessionId::new("a", "1"),
            InstanceNodeSessionId::new("b", "2"),
        )
    }

    #[test]
    fn test_result_code_wire_names() {
        for code in [
            ResultCode::Success,
            ResultCode::NoRouteToDestinationAtSender,
            ResultCode::NoRouteToDestinationWhileForwarding,
            ResultCode::MaxHopCountExceeded,
            ResultCode::IncompatibleProtocolVersion,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_forwarded_keeps_id_and_counts_hops() {
        let (a, b) = ids();
        let relay = InstanceNodeSessionId::new("r", "9");
        let req = NetworkRequest::new(message_type::TEST, b"x".to_vec(), a, b);
        let once = req.forwarded(&relay);
        let twice = once.forwarded(&relay);
        assert_eq!(twice.request_id, req.request_id);
        assert_eq!(req.hop_count, 0);
        assert_eq!(twice.hop_count, 2);
        assert_eq!(twice.trace(), vec!["r:9".to_string(), "r:9".to_string()]);
    }

    #[test]
    fn test_failure_response_description() {
        let resp = NetworkResponse::failure(
            "req-1",
            ResultCode::NoRouteToDestinationAtSender,
            "no route to b:2",
        );
        assert!(!resp.is_success());
        assert_eq!(
            resp.failure_description(),
            "NO_ROUTE_TO_DESTINATION_AT_SENDER: no route to b:2"
        );
    }

    #[test]
    fn test_request_json_shape() {
        let (a, b) = ids();
        let req = NetworkRequest::new(message_type::RPC, vec![1, 2, 3], a, b);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["message_type"], "rpc");
        assert_eq!(json["body"], "AQID");
        let back: NetworkRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
