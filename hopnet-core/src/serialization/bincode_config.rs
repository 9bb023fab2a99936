//! Deterministic bincode configuration.
//!
//! Fixed-size integer encoding, little-endian byte order, trailing bytes
//! rejected on decode.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SerializationError;

fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Serialize a value to bytes.
///
/// Identical inputs produce identical output on every platform.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    config()
        .serialize(value)
        .map_err(|e| SerializationError::EncodeFailed(e.to_string()))
}

/// Deserialize a value from bytes.
///
/// Fails on malformed input, trailing bytes, or a type mismatch.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    config()
        .deserialize(bytes)
        .map_err(|e| SerializationError::DecodeFailed(e.to_string()))
}
