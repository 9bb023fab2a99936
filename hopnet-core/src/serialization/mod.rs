//! Deterministic binary serialization.
//!
//! The write-ahead log replays state changes byte-for-byte, so every
//! persisted value must encode identically on every platform and every
//! run. All persistence and framing goes through this module.

mod bincode_config;

pub use bincode_config::{deserialize, serialize};
