//! # Hopnet Core
//!
//! Core types, cryptography, and serialization for the hopnet
//! payment-channel protocol.
//!
//! This crate provides the foundation for all other hopnet crates:
//! - Cryptographic primitives (Ed25519 signatures, Keccak-256 hashing)
//! - Protocol data types (locks, balance proofs, channel identifiers)
//! - 256-bit token amounts
//! - Deterministic binary serialization for the write-ahead log and wire

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod error;
pub mod serialization;
pub mod types;
pub mod u256;

// Re-export commonly used types at crate root
pub use crypto::{
    derive_address, keccak256, keccak256_concat, sign, verify, KeyPair, PublicKey, SecretKey,
    Signature,
};
pub use error::{CoreError, CryptoError, SerializationError};
pub use types::{
    Address, BalanceProof, BlockNumber, ChannelId, Lock, LocksRoot, Nonce, PendingLock, Secret,
    SecretHash, TokenAddress, UnclaimedLock, EMPTY_LOCKS_ROOT,
};
pub use u256::TokenAmount;
