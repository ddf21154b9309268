//! Conversion between message blocks and their JSON payloads.

use crate::entities::{ChannelCreationRequest, ChannelCreationResponse, ToolDescriptorListUpdate};
use crate::error::{UplinkError, UplinkResult};
use crate::protocol::{MessageBlock, MessageType};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

pub type HandshakeData = HashMap<String, String>;

pub fn encode_json<T: Serialize>(message_type: MessageType, payload: &T) -> UplinkResult<MessageBlock> {
    let data = serde_json::to_vec(payload).map_err(|e| {
        UplinkError::protocol(format!("Failed to encode JSON message of type {message_type}: {e}"))
    })?;
    MessageBlock::new(message_type, data)
}

pub fn decode_json<T: DeserializeOwned>(expected: MessageType, block: &MessageBlock) -> UplinkResult<T> {
    if block.message_type != expected {
        return Err(UplinkError::protocol(format!(
            "Expected a message of type {expected}, got {}",
            block.message_type
        )));
    }
    serde_json::from_slice(&block.data).map_err(|e| {
        UplinkError::protocol(format!(
            "Failed to decode JSON message of expected type {expected}: {e}"
        ))
    })
}

pub fn encode_handshake_data(data: &HandshakeData) -> UplinkResult<MessageBlock> {
    encode_json(MessageType::Handshake, data)
}

pub fn decode_handshake_data(block: &MessageBlock) -> UplinkResult<HandshakeData> {
    decode_json(MessageType::Handshake, block)
}

pub fn encode_tool_descriptor_list_update(update: &ToolDescriptorListUpdate) -> UplinkResult<MessageBlock> {
    encode_json(MessageType::ToolDescriptorListUpdate, update)
}

pub fn decode_tool_descriptor_list_update(block: &MessageBlock) -> UplinkResult<ToolDescriptorListUpdate> {
    decode_json(MessageType::ToolDescriptorListUpdate, block)
}

pub fn encode_channel_creation_request(request: &ChannelCreationRequest) -> UplinkResult<MessageBlock> {
    encode_json(MessageType::ChannelInit, request)
}

pub fn decode_channel_creation_request(block: &MessageBlock) -> UplinkResult<ChannelCreationRequest> {
    decode_json(MessageType::ChannelInit, block)
}

pub fn encode_channel_creation_response(response: &ChannelCreationResponse) -> UplinkResult<MessageBlock> {
    encode_json(MessageType::ChannelInitResponse, response)
}

pub fn decode_channel_creation_response(block: &MessageBlock) -> UplinkResult<ChannelCreationResponse> {
    decode_json(MessageType::ChannelInitResponse, block)
}

/// A `GOODBYE` carrying an already wrapped error message.
pub fn encode_error_goodbye(wrapped_message: &str) -> MessageBlock {
    let message = if wrapped_message.is_empty() {
        warn!("Uplink: empty goodbye error message, using a placeholder");
        "<no message available>"
    } else {
        wrapped_message
    };
    // error texts are short; cut pathological ones instead of failing
    let mut data = message.as_bytes().to_vec();
    data.truncate(crate::protocol::MAX_MESSAGE_BLOCK_DATA_LENGTH);
    MessageBlock {
        message_type: MessageType::Goodbye,
        data,
    }
}

/// The error text of a goodbye block; `None` for a regular goodbye.
pub fn goodbye_error_message(block: &MessageBlock) -> Option<String> {
    if block.data.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&block.data).into_owned())
    }
}
