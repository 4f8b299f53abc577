//! JSON text codec shared by the client protocol and the fabric.

use crate::error::{RoomcastError, RoomcastResult};

/// Largest text frame accepted from a client or the fabric (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encode a value as a single JSON text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> RoomcastResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text frame into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> RoomcastResult<T> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(RoomcastError::InvalidEvent(format!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }
    serde_json::from_str(text).map_err(|e| RoomcastError::InvalidEvent(e.to_string()))
}
