//! Protocol error types.

use thiserror::Error;

/// Errors in message handling and framing.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame announced a bogus magic value.
    #[error("invalid network magic: expected {expected:02x?}, got {actual:02x?}")]
    InvalidMagic {
        /// The protocol's magic bytes.
        expected: [u8; 4],
        /// What arrived.
        actual: [u8; 4],
    },

    /// A frame exceeded the size limit.
    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge {
        /// Announced size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The envelope signature does not verify.
    #[error("invalid message signature")]
    InvalidSignature,

    /// The peer is not reachable.
    #[error("peer unreachable after {attempts} delivery attempts")]
    PeerUnreachable {
        /// How many deliveries were attempted.
        attempts: u32,
    },

    /// Transport-level IO failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hopnet_core::SerializationError> for ProtoError {
    fn from(e: hopnet_core::SerializationError) -> Self {
        ProtoError::Serialization(e.to_string())
    }
}

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;
