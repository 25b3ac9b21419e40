//! Codec for encoding and decoding relay events.
//!
//! Text WebSocket messages carry JSON; binary messages carry MessagePack with
//! named fields. Each WebSocket message holds exactly one event.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Default maximum encoded event size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encoding used for outbound events on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON in text messages.
    #[default]
    Json,
    /// MessagePack in binary messages.
    MessagePack,
}

impl WireFormat {
    /// Parse the `format` handshake parameter. Unknown values yield `None`.
    #[must_use]
    pub fn from_param(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(WireFormat::Json),
            "msgpack" | "messagepack" => Some(WireFormat::MessagePack),
            _ => None,
        }
    }
}

/// An encoded event ready to be written to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

impl Encoded {
    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Whether the encoded payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a server event in the given format.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent, format: WireFormat) -> Result<Encoded, ProtocolError> {
    match format {
        WireFormat::Json => Ok(Encoded::Text(serde_json::to_string(event)?)),
        WireFormat::MessagePack => Ok(Encoded::Binary(Bytes::from(to_msgpack(event)?))),
    }
}

/// Decode a client event from a text message.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a known event.
pub fn decode_text(text: &str, max_size: usize) -> Result<ClientEvent, ProtocolError> {
    check_size(text.len(), max_size)?;
    Ok(serde_json::from_str(text)?)
}

/// Decode a client event from a binary message.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a known event.
pub fn decode_binary(data: &[u8], max_size: usize) -> Result<ClientEvent, ProtocolError> {
    check_size(data.len(), max_size)?;
    from_msgpack(data)
}

/// Serialize any event to MessagePack with named fields.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserialize any event from MessagePack.
///
/// # Errors
///
/// Returns an error if the data is not valid MessagePack for `T`.
pub fn from_msgpack<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}
