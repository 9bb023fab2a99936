//! Node address derivation.
//!
//! A node address is the first 20 bytes of Keccak-256(public key). The
//! 160-bit form matches the width the escrow contract uses for
//! participants, and keeps wire messages compact.

use super::hashing::keccak256;
use super::keys::PublicKey;
use crate::types::Address;

/// Derive a node address from a public key.
pub fn derive_address(public_key: &PublicKey) -> Address {
    let hash = keccak256(public_key.as_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[..20]);
    address
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_address_determinism() {
        let kp = KeyPair::generate();
        assert_eq!(derive_address(&kp.public_key()), derive_address(&kp.public_key()));
    }

    #[test]
    fn test_different_keys_different_addresses() {
        let a = derive_address(&KeyPair::generate().public_key());
        let b = derive_address(&KeyPair::generate().public_key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_is_hash_prefix() {
        let kp = KeyPair::generate();
        let full = keccak256(kp.public_key().as_bytes());
        let address = derive_address(&kp.public_key());
        assert_eq!(&full[..20], &address[..]);
    }
}
