//! Keccak-256 hashing utilities.
//!
//! The protocol identifies a payment by the Keccak-256 hash of its secret,
//! so everything that must agree with the on-chain secret registry uses
//! the same digest.

use sha3::{Digest, Keccak256};

/// Compute the Keccak-256 hash of the input data.
#[inline]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the Keccak-256 hash of concatenated data slices.
///
/// Avoids allocating an intermediate buffer for the concatenation.
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_determinism() {
        let h1 = keccak256(b"payment secret");
        let h2 = keccak256(b"payment secret");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_keccak256_known_value() {
        // Keccak-256 of the empty input, as used by the secret registry.
        let hash = keccak256(b"");
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak256_concat_equals_manual() {
        let concat = keccak256_concat(&[b"ab", b"cd"]);
        let manual = keccak256(b"abcd");
        assert_eq!(concat, manual);
    }

    #[test]
    fn test_different_inputs_differ() {
        assert_ne!(keccak256(b"a"), keccak256(b"b"));
    }
}
