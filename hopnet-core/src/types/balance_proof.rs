//! Signed balance proofs.

use serde::{Deserialize, Serialize};

use super::{ChannelId, LocksRoot, Nonce};
use crate::crypto::{sign, verify, KeyPair, PublicKey, Signature};
use crate::error::CryptoError;
use crate::u256::TokenAmount;

/// A signed record fixing a channel end's cumulative transfer.
///
/// Balance proofs are monotonic: each successor must carry a strictly
/// larger nonce and a transferred amount that never decreases. The
/// locks root commits to the set of pending locks, so the triple
/// (transferred, locks root, nonce) pins the entire off-chain balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceProof {
    /// Strictly increasing per channel end.
    pub nonce: Nonce,
    /// Cumulative amount transferred to the partner; never decreases.
    pub transferred_amount: TokenAmount,
    /// Merkle root over the pending lock hashes.
    pub locks_root: LocksRoot,
    /// Channel the proof belongs to.
    pub channel_id: ChannelId,
    /// Hash binding the proof to the carrying message.
    pub additional_hash: [u8; 32],
    /// Sender's signature over `signing_data`.
    pub signature: Signature,
}

impl BalanceProof {
    /// Build and sign a balance proof.
    pub fn new_signed(
        nonce: Nonce,
        transferred_amount: TokenAmount,
        locks_root: LocksRoot,
        channel_id: ChannelId,
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> Self {
        let data = signing_data(nonce, &transferred_amount, &locks_root, &channel_id, &additional_hash);
        let signature = sign(keypair.signing_key(), &data);
        BalanceProof {
            nonce,
            transferred_amount,
            locks_root,
            channel_id,
            additional_hash,
            signature,
        }
    }

    /// The canonical byte layout the signature covers: nonce (8,
    /// big-endian) ‖ transferred amount (32) ‖ locks root (32) ‖ channel
    /// id (32) ‖ additional hash (32).
    pub fn signing_data(&self) -> Vec<u8> {
        signing_data(
            self.nonce,
            &self.transferred_amount,
            &self.locks_root,
            &self.channel_id,
            &self.additional_hash,
        )
    }

    /// Verify the signature against the expected signer.
    pub fn verify_signature(&self, signer: &PublicKey) -> Result<(), CryptoError> {
        verify(signer, &self.signing_data(), &self.signature)
    }

    /// Whether `successor` is a legal follow-up to this proof: larger
    /// nonce, non-decreasing transferred amount, same channel.
    pub fn is_valid_successor(&self, successor: &BalanceProof) -> bool {
        successor.nonce > self.nonce
            && successor.transferred_amount >= self.transferred_amount
            && successor.channel_id == self.channel_id
    }
}

fn signing_data(
    nonce: Nonce,
    transferred_amount: &TokenAmount,
    locks_root: &LocksRoot,
    channel_id: &ChannelId,
    additional_hash: &[u8; 32],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + 32 + 32 + 32 + 32);
    data.extend_from_slice(&nonce.to_be_bytes());
    data.extend_from_slice(&transferred_amount.to_be_bytes());
    data.extend_from_slice(locks_root);
    data.extend_from_slice(channel_id);
    data.extend_from_slice(additional_hash);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMPTY_LOCKS_ROOT;

    fn proof(nonce: Nonce, transferred: u64, keypair: &KeyPair) -> BalanceProof {
        BalanceProof::new_signed(
            nonce,
            TokenAmount::from_u64(transferred),
            EMPTY_LOCKS_ROOT,
            [1u8; 32],
            [0u8; 32],
            keypair,
        )
    }

    #[test]
    fn test_signature_verifies() {
        let kp = KeyPair::generate();
        let bp = proof(1, 30, &kp);
        assert!(bp.verify_signature(&kp.public_key()).is_ok());
    }

    #[test]
    fn test_tampered_proof_rejected() {
        let kp = KeyPair::generate();
        let mut bp = proof(1, 30, &kp);
        bp.transferred_amount = TokenAmount::from_u64(31);
        assert!(bp.verify_signature(&kp.public_key()).is_err());
    }

    #[test]
    fn test_successor_rules() {
        let kp = KeyPair::generate();
        let first = proof(1, 30, &kp);

        assert!(first.is_valid_successor(&proof(2, 30, &kp)));
        assert!(first.is_valid_successor(&proof(2, 50, &kp)));
        // Nonce must strictly increase.
        assert!(!first.is_valid_successor(&proof(1, 50, &kp)));
        // Transferred amount must not decrease.
        assert!(!first.is_valid_successor(&proof(2, 29, &kp)));
    }

    #[test]
    fn test_signing_data_length() {
        let kp = KeyPair::generate();
        assert_eq!(proof(1, 1, &kp).signing_data().len(), 136);
    }
}
