//! Serialized RPC envelopes.

use nodelink_types::InstanceNodeSessionId;
use serde::{Deserialize, Serialize};

/// Reference to a callback object living on its home node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackHandle {
    pub object_id: String,
    pub home_node: InstanceNodeSessionId,
    /// Interface the object implements.
    pub interface: String,
}

/// A parameter or return value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RpcValue {
    Data(serde_json::Value),
    Callback(CallbackHandle),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallRequest {
    pub target: InstanceNodeSessionId,
    pub caller: InstanceNodeSessionId,
    /// Interface name of the service.
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<RpcValue>,
    #[serde(default)]
    pub hop_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ServiceCallResult {
    Return { value: RpcValue },
    /// The call could not be performed.
    RemoteOperationError { message: String },
    /// The method ran and returned an error.
    MethodError { type_name: String, message: String },
}

impl ServiceCallResult {
    pub fn remote_operation_error(message: impl Into<String>) -> Self {
        ServiceCallResult::RemoteOperationError {
            message: message.into(),
        }
    }
}
