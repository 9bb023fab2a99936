//! Cryptographic primitives.
//!
//! Node identities are Ed25519 key pairs; every wire message and balance
//! proof is signed with the sender's key. All protocol hashes (hashlocks,
//! lock hashes, locks roots, echo hashes) are Keccak-256.

mod address;
mod hashing;
mod keys;
mod signing;

pub use address::derive_address;
pub use hashing::{keccak256, keccak256_concat};
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use signing::{sign, verify, Signature};
