//! Codec for encoding and decoding Tether frames.
//!
//! Frames travel either as JSON text or as MessagePack binary. A WebSocket
//! message carries exactly one frame; Comet request and response bodies carry
//! an array of frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frames::ProtocolMessage;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire format negotiated through the `format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    #[serde(alias = "messagepack")]
    MsgPack,
}

impl Format {
    /// Query parameter value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::MsgPack => "msgpack",
        }
    }

    /// HTTP content type for request and response bodies.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::MsgPack => "application/x-msgpack",
        }
    }

    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Format::MsgPack)
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error in either direction.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}

fn to_vec<T: Serialize + ?Sized>(value: &T, format: Format) -> Result<Vec<u8>, ProtocolError> {
    let payload = match format {
        Format::Json => serde_json::to_vec(value)?,
        Format::MsgPack => rmp_serde::to_vec_named(value)?,
    };
    check_size(payload.len())?;
    Ok(payload)
}

fn from_slice<'a, T: Deserialize<'a>>(data: &'a [u8], format: Format) -> Result<T, ProtocolError> {
    check_size(data.len())?;
    let value = match format {
        Format::Json => serde_json::from_slice(data)?,
        Format::MsgPack => rmp_serde::from_slice(data)?,
    };
    Ok(value)
}

/// Encode a frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &ProtocolMessage, format: Format) -> Result<Bytes, ProtocolError> {
    to_vec(frame, format).map(Bytes::from)
}

/// Encode several frames as one array body.
///
/// # Errors
///
/// Returns an error if the body is too large or encoding fails.
pub fn encode_batch(frames: &[ProtocolMessage], format: Format) -> Result<Bytes, ProtocolError> {
    to_vec(frames, format).map(Bytes::from)
}

/// Decode a single frame.
///
/// # Errors
///
/// Returns an error if the data is too large or invalid.
pub fn decode(data: &[u8], format: Format) -> Result<ProtocolMessage, ProtocolError> {
    from_slice(data, format)
}

/// Decode an array body. A body holding a single frame object is accepted too.
///
/// # Errors
///
/// Returns an error if the data is too large or invalid.
pub fn decode_batch(data: &[u8], format: Format) -> Result<Vec<ProtocolMessage>, ProtocolError> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match from_slice::<Vec<ProtocolMessage>>(data, format) {
        Ok(frames) => Ok(frames),
        Err(batch_err) => match from_slice::<ProtocolMessage>(data, format) {
            Ok(frame) => Ok(vec![frame]),
            Err(_) => Err(batch_err),
        },
    }
}
