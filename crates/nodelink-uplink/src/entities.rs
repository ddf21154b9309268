//! JSON payloads carried in message blocks.

use serde::{Deserialize, Serialize};

/// A tool offered by a client for remote execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub tool_id: String,
    pub tool_version: String,
    /// Groups allowed to see this tool; `"public"` for everyone.
    #[serde(default)]
    pub authorization_group_ids: Vec<String>,
    /// Hash of the tool's documentation, if any is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_hash: Option<String>,
}

impl ToolDescriptor {
    pub fn new(tool_id: impl Into<String>, tool_version: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            tool_version: tool_version.into(),
            authorization_group_ids: Vec::new(),
            documentation_hash: None,
        }
    }
}

/// The complete tool list of one destination. An empty list retracts all
/// tools previously published for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptorListUpdate {
    pub destination_id: String,
    pub display_name: String,
    pub tool_descriptors: Vec<ToolDescriptor>,
}

impl ToolDescriptorListUpdate {
    pub fn retraction(destination_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            display_name: String::new(),
            tool_descriptors: Vec::new(),
        }
    }

    pub fn is_retraction(&self) -> bool {
        self.tool_descriptors.is_empty()
    }
}

/// `CHANNEL_INIT`: sent by the initiating client with an undefined channel
/// id, forwarded by the relay to the destination with the assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreationRequest {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub destination_id: String,
    pub channel_id: i64,
    /// Chosen by the initiator and returned unchanged in the response.
    pub request_id: String,
}

/// `CHANNEL_INIT_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreationResponse {
    pub channel_id: i64,
    pub request_id: String,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_request_field_names() {
        let request = ChannelCreationRequest {
            channel_type: "exec".into(),
            destination_id: "dest".into(),
            channel_id: -1,
            request_id: "1".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "exec");
        assert_eq!(json["destinationId"], "dest");
        assert_eq!(json["channelId"], -1);
        assert_eq!(json["requestId"], "1");
    }

    #[test]
    fn test_retraction() {
        let update = ToolDescriptorListUpdate::retraction("d");
        assert!(update.is_retraction());
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"toolDescriptors\":[]"));
    }
}
