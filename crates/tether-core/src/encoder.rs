//! Outbound payload encoding.
//!
//! Channel publishes pass every message through a [`PayloadEncoder`] before
//! the frame is built. Encryption and custom codecs plug in here.

use tether_protocol::{ErrorInfo, Message};

/// Error code for payloads that cannot be encoded.
pub const ENCODING_ERROR: u32 = 40013;

/// Transforms message payloads before they are published.
pub trait PayloadEncoder: Send + Sync {
    /// Encode one message for `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded; the publish fails
    /// without anything being sent.
    fn encode(&self, channel: &str, message: Message) -> Result<Message, ErrorInfo>;
}

/// Leaves payloads untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityEncoder;

impl PayloadEncoder for IdentityEncoder {
    fn encode(&self, _channel: &str, message: Message) -> Result<Message, ErrorInfo> {
        Ok(message)
    }
}

/// Serializes object and array payloads to JSON strings and records
/// `json` in the message encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl PayloadEncoder for JsonEncoder {
    fn encode(&self, _channel: &str, mut message: Message) -> Result<Message, ErrorInfo> {
        let Some(data) = message.data.take() else {
            return Ok(message);
        };
        if !(data.is_object() || data.is_array()) {
            message.data = Some(data);
            return Ok(message);
        }
        let text = serde_json::to_string(&data)
            .map_err(|e| ErrorInfo::new(ENCODING_ERROR, 400, format!("Unable to encode payload: {e}")))?;
        message.data = Some(serde_json::Value::String(text));
        message.encoding = Some(match message.encoding.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}/json"),
            _ => "json".to_string(),
        });
        Ok(message)
    }
}
