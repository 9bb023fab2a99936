//! Error types for the hopnet core crate.

use std::fmt;

/// Top-level error type for hopnet-core operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreError {
    /// Cryptographic operation failed.
    Crypto(CryptoError),
    /// Serialization or deserialization failed.
    Serialization(SerializationError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Crypto(e) => write!(f, "crypto error: {}", e),
            CoreError::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        CoreError::Crypto(e)
    }
}

impl From<SerializationError> for CoreError {
    fn from(e: SerializationError) -> Self {
        CoreError::Serialization(e)
    }
}

/// Errors related to cryptographic operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// The signature is malformed.
    InvalidSignature,
    /// The public key is malformed.
    InvalidPublicKey,
    /// The secret key is malformed.
    InvalidSecretKey,
    /// Signature verification failed against the message and key.
    SignatureVerificationFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidSignature => write!(f, "invalid signature format"),
            CryptoError::InvalidPublicKey => write!(f, "invalid public key format"),
            CryptoError::InvalidSecretKey => write!(f, "invalid secret key format"),
            CryptoError::SignatureVerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Errors related to serialization and deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializationError {
    /// Failed to encode a value to bytes.
    EncodeFailed(String),
    /// Failed to decode a value from bytes.
    DecodeFailed(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::EncodeFailed(msg) => write!(f, "encode failed: {}", msg),
            SerializationError::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
        }
    }
}

impl std::error::Error for SerializationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CoreError::Crypto(CryptoError::SignatureVerificationFailed);
        assert!(e.to_string().contains("verification failed"));

        let e = CoreError::Serialization(SerializationError::DecodeFailed("eof".into()));
        assert!(e.to_string().contains("decode failed"));
    }

    #[test]
    fn test_error_conversion() {
        let err: CoreError = CryptoError::InvalidPublicKey.into();
        assert!(matches!(err, CoreError::Crypto(CryptoError::InvalidPublicKey)));
    }
}
