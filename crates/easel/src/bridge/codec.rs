//! Text-frame codec for bridge messages.
//!
//! The transport preserves message boundaries (one WebSocket text frame per
//! message), so the codec only handles serde_json serialization. No length
//! prefix or delimiter is added.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

/// Frames larger than this are logged at info level.
const LARGE_FRAME_BYTES: usize = 100_000;

/// Inbound frame could not be decoded (the `MalformedMessage` case).
///
/// Never surfaced to a pending caller: without a parsed id it cannot be
/// attributed to any request.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Codec that maps one message of type `T` to one JSON text frame.
pub struct JsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize> JsonCodec<T> {
    pub fn encode(&self, item: &T) -> Result<String, CodecError> {
        let json = serde_json::to_string(item).map_err(CodecError::Encode)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        Ok(json)
    }
}

impl<T: DeserializeOwned> JsonCodec<T> {
    pub fn decode(&self, frame: &str) -> Result<T, CodecError> {
        serde_json::from_str(frame).map_err(CodecError::Malformed)
    }
}

/// Best-effort recovery of a string `id` from a frame that failed to decode.
pub fn recover_id(frame: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(frame).ok()?;
    value.get("id")?.as_str().map(str::to_owned)
}
