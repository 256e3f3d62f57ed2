use serde::Serialize;
use serde::de::DeserializeOwned;

use super::messages::{ClientMessage, MessageKind, ServerMessage};

/// Maximum text frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024; // 16 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    PayloadTooLarge(usize),
    MissingType,
    UnknownMessageType(String),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::PayloadTooLarge(size) => {
                write!(
                    f,
                    "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})"
                )
            },
            Self::MissingType => write!(f, "message has no type"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    Ok(text)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    encode(msg)
}

/// Server frames are not size-capped: a MEDIATE board or GAME_END may be
/// larger than anything a client is allowed to send.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

fn parse_value(text: &str) -> Result<serde_json::Value, ProtocolError> {
    if text.trim().is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

fn kind_of(value: &serde_json::Value) -> Result<MessageKind, ProtocolError> {
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    serde_json::from_value(serde_json::Value::String(tag.to_string()))
        .map_err(|_| ProtocolError::UnknownMessageType(tag.to_string()))
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

/// Decode one inbound text frame. Server-only kinds count as unknown.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    let value = parse_value(text)?;
    let kind = kind_of(&value)?;
    if !kind.is_inbound() {
        return Err(ProtocolError::UnknownMessageType(format!("{kind:?}")));
    }
    decode(value)
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    let value = parse_value(text)?;
    kind_of(&value)?;
    decode(value)
}
