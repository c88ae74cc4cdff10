//! CBOR encoding for control messages.
//!
//! WebSocket framing already gives us message boundaries, so each binary
//! frame is a single bare CBOR value — no length prefix.

use crate::error::HpcshResult;
use std::io::Cursor;

/// Maximum accepted message size (1 MiB). Larger frames are rejected at
/// the transport layer before decoding.
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Encode a serializable value into a CBOR payload.
pub fn encode_message<T: serde::Serialize>(value: &T) -> HpcshResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a typed value.
pub fn decode_message<T: serde::de::DeserializeOwned>(data: &[u8]) -> HpcshResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}
