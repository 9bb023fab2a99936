//! Ed25519 signature creation and verification.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::keys::{PublicKey, SecretKey};
use crate::error::CryptoError;

/// Ed25519 signature wrapper serializing as its raw 64 bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub ed25519_dalek::Signature);

impl Signature {
    /// Create a Signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Signature(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// Get the raw bytes of the signature.
    #[inline]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SignatureVisitor;

        impl<'de> serde::de::Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("64 bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Signature, E> {
                if v.len() != 64 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let bytes: [u8; 64] = v.try_into().unwrap();
                Ok(Signature::from_bytes(&bytes))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Signature, A::Error> {
                let mut bytes = [0u8; 64];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Signature::from_bytes(&bytes))
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

/// Sign a message with a secret key.
pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Signature {
    Signature(secret_key.sign(message))
}

/// Verify a signature against a message and public key.
pub fn verify(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    public_key
        .inner()
        .verify(message, &signature.0)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}
