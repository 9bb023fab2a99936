//! Wire messages.
//!
//! Every message travels inside a [`SignedMessage`] envelope carrying
//! the sender's public key and an Ed25519 signature over the message's
//! canonical serialization. Messages that move channel balance embed a
//! full [`BalanceProof`], which carries its own signature the channel
//! layer validates independently.

use serde::{Deserialize, Serialize};

use hopnet_core::serialization::serialize;
use hopnet_core::{
    keccak256_concat, sign, verify, Address, BalanceProof, ChannelId, KeyPair, Lock, PublicKey,
    Secret, SecretHash, Signature, TokenAddress, TokenAmount,
};

use crate::error::{ProtoError, ProtoResult};

// === Balance-proof binding hashes ===
//
// A balance proof signs an `additional_hash` committing to the fields
// of the message that carries it, so a proof lifted from one message
// cannot be spliced into another. The sender computes the hash before
// signing the proof; the receiver recomputes it from the arrived
// message and rejects a mismatch. The leading tag separates the
// message domains.

/// Binding hash for a [`DirectTransfer`].
pub fn direct_transfer_binding(
    payment_id: u64,
    token_address: &TokenAddress,
    recipient: &Address,
) -> [u8; 32] {
    keccak256_concat(&[
        &b"direct"[..],
        &payment_id.to_be_bytes(),
        token_address,
        recipient,
    ])
}

/// Binding hash for a [`MediatedTransfer`].
pub fn mediated_transfer_binding(
    payment_id: u64,
    token_address: &TokenAddress,
    recipient: &Address,
    target: &Address,
    initiator: &Address,
    lock: &Lock,
    fee: &TokenAmount,
) -> [u8; 32] {
    let lock_bytes = lock.as_bytes();
    keccak256_concat(&[
        &b"mediated"[..],
        &payment_id.to_be_bytes(),
        token_address,
        recipient,
        target,
        initiator,
        lock_bytes.as_slice(),
        &fee.to_be_bytes(),
    ])
}

/// Binding hash for an [`Unlock`].
pub fn unlock_binding(payment_id: u64, token_address: &TokenAddress, secret: &Secret) -> [u8; 32] {
    keccak256_concat(&[
        &b"unlock"[..],
        &payment_id.to_be_bytes(),
        token_address,
        secret,
    ])
}

/// Binding hash for an [`AnnounceDisposedResponse`].
pub fn disposed_response_binding(channel_id: &ChannelId, secret_hash: &SecretHash) -> [u8; 32] {
    keccak256_concat(&[&b"disposed"[..], channel_id, secret_hash])
}

/// Binding hash for a [`RemoveExpiredLock`].
pub fn remove_expired_binding(channel_id: &ChannelId, secret_hash: &SecretHash) -> [u8; 32] {
    keccak256_concat(&[&b"expired"[..], channel_id, secret_hash])
}

/// Acknowledges receipt of the message hashing to `echo_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Echo hash of the acknowledged message.
    pub echo_hash: [u8; 32],
}

/// Liveness probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Probe nonce, echoed back in the pong.
    pub nonce: u64,
}

/// Liveness probe response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// The probed nonce.
    pub nonce: u64,
}

/// Unconditional off-chain transfer: the new balance proof simply moves
/// `transferred_amount` forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectTransfer {
    /// Caller-chosen payment identifier.
    pub payment_id: u64,
    /// Token being transferred.
    pub token_address: TokenAddress,
    /// The receiving partner.
    pub recipient: Address,
    /// The successor balance proof.
    pub balance_proof: BalanceProof,
}

impl DirectTransfer {
    /// The binding hash this message's proof must carry.
    pub fn additional_hash(&self) -> [u8; 32] {
        direct_transfer_binding(self.payment_id, &self.token_address, &self.recipient)
    }
}

/// Hash-time-locked transfer, relayed hop by hop toward the target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatedTransfer {
    /// Payment identifier, constant across hops.
    pub payment_id: u64,
    /// Token being transferred.
    pub token_address: TokenAddress,
    /// The hop's payee.
    pub recipient: Address,
    /// The payment's final recipient.
    pub target: Address,
    /// The original payer.
    pub initiator: Address,
    /// The new lock.
    pub lock: Lock,
    /// Fee budget left for downstream hops.
    pub fee: TokenAmount,
    /// The successor balance proof committing to the lock.
    pub balance_proof: BalanceProof,
}

impl MediatedTransfer {
    /// The binding hash this message's proof must carry.
    pub fn additional_hash(&self) -> [u8; 32] {
        mediated_transfer_binding(
            self.payment_id,
            &self.token_address,
            &self.recipient,
            &self.target,
            &self.initiator,
            &self.lock,
            &self.fee,
        )
    }
}

/// The target asking the initiator for the payment secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequest {
    /// Payment identifier.
    pub payment_id: u64,
    /// Hashlock of the payment.
    pub secret_hash: SecretHash,
    /// Amount the requester expects.
    pub amount: TokenAmount,
}

/// Reveals a payment secret; `keccak256(secret)` is the hashlock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealSecret {
    /// The secret.
    pub secret: Secret,
}

/// Settles a claimable lock: the balance proof removes the lock and
/// folds its amount into the transferred total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unlock {
    /// Payment identifier.
    pub payment_id: u64,
    /// Token being transferred.
    pub token_address: TokenAddress,
    /// The revealed secret proving the claim.
    pub secret: Secret,
    /// The successor balance proof.
    pub balance_proof: BalanceProof,
}

impl Unlock {
    /// The binding hash this message's proof must carry.
    pub fn additional_hash(&self) -> [u8; 32] {
        unlock_binding(self.payment_id, &self.token_address, &self.secret)
    }
}

/// Declares a received lock abandoned; it must never be redeemed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceDisposed {
    /// Channel the lock lives on.
    pub channel_id: ChannelId,
    /// The abandoned lock.
    pub lock: Lock,
}

/// The payer's response to a disposal: a balance proof with the lock
/// removed from the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceDisposedResponse {
    /// Channel the lock lived on.
    pub channel_id: ChannelId,
    /// Hashlock of the removed lock.
    pub secret_hash: SecretHash,
    /// The successor balance proof.
    pub balance_proof: BalanceProof,
}

impl AnnounceDisposedResponse {
    /// The binding hash this message's proof must carry.
    pub fn additional_hash(&self) -> [u8; 32] {
        disposed_response_binding(&self.channel_id, &self.secret_hash)
    }
}

/// Removes an expired lock from the sender's tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveExpiredLock {
    /// Channel the lock lived on.
    pub channel_id: ChannelId,
    /// Hashlock of the expired lock.
    pub secret_hash: SecretHash,
    /// The successor balance proof.
    pub balance_proof: BalanceProof,
}

impl RemoveExpiredLock {
    /// The binding hash this message's proof must carry.
    pub fn additional_hash(&self) -> [u8; 32] {
        remove_expired_binding(&self.channel_id, &self.secret_hash)
    }
}

/// Asks the partner to co-sign an on-chain withdraw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    /// Channel to withdraw from.
    pub channel_id: ChannelId,
    /// The withdrawing participant.
    pub participant: Address,
    /// New total withdrawn amount being requested.
    pub total_withdraw: TokenAmount,
}

/// The partner's signature over a withdraw request, or its rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawResponse {
    /// Channel the request was for.
    pub channel_id: ChannelId,
    /// The withdrawing participant.
    pub participant: Address,
    /// The agreed total withdrawn amount.
    pub total_withdraw: TokenAmount,
    /// Partner's signature over the withdraw data; None refuses and
    /// cancels the negotiation.
    pub partner_signature: Option<Signature>,
}

/// Asks the partner to co-sign closing the channel at agreed balances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeSettleRequest {
    /// Channel to settle.
    pub channel_id: ChannelId,
    /// Final balance of participant one.
    pub participant1_balance: TokenAmount,
    /// Final balance of participant two.
    pub participant2_balance: TokenAmount,
}

/// The partner's signature over a cooperative settle, or its rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeSettleResponse {
    /// Channel the request was for.
    pub channel_id: ChannelId,
    /// Final balance of participant one.
    pub participant1_balance: TokenAmount,
    /// Final balance of participant two.
    pub participant2_balance: TokenAmount,
    /// Partner's signature over the settle data; None refuses and
    /// cancels the negotiation.
    pub partner_signature: Option<Signature>,
}

/// All hopnet wire messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// Receipt acknowledgement.
    Ack(Ack),
    /// Liveness probe.
    Ping(Ping),
    /// Liveness response.
    Pong(Pong),
    /// Unconditional transfer.
    DirectTransfer(DirectTransfer),
    /// Hash-time-locked transfer.
    MediatedTransfer(MediatedTransfer),
    /// Secret request from the target.
    SecretRequest(SecretRequest),
    /// Secret revelation.
    RevealSecret(RevealSecret),
    /// Lock settlement.
    Unlock(Unlock),
    /// Lock abandonment declaration.
    AnnounceDisposed(AnnounceDisposed),
    /// Lock abandonment response.
    AnnounceDisposedResponse(AnnounceDisposedResponse),
    /// Expired lock removal.
    RemoveExpiredLock(RemoveExpiredLock),
    /// Withdraw negotiation request.
    WithdrawRequest(WithdrawRequest),
    /// Withdraw negotiation response.
    WithdrawResponse(WithdrawResponse),
    /// Cooperative settle request.
    CooperativeSettleRequest(CooperativeSettleRequest),
    /// Cooperative settle response.
    CooperativeSettleResponse(CooperativeSettleResponse),
}

impl Message {
    /// Whether this message must be acknowledged by the receiver.
    ///
    /// Acks themselves and liveness probes are fire-and-forget.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, Message::Ack(_) | Message::Ping(_) | Message::Pong(_))
    }

    /// The hashlock this message is about, if any.
    pub fn secret_hash(&self) -> Option<SecretHash> {
        match self {
            Message::MediatedTransfer(m) => Some(m.lock.secret_hash),
            Message::SecretRequest(m) => Some(m.secret_hash),
            Message::RevealSecret(m) => Some(hopnet_core::keccak256(&m.secret)),
            Message::Unlock(m) => Some(hopnet_core::keccak256(&m.secret)),
            Message::AnnounceDisposed(m) => Some(m.lock.secret_hash),
            Message::AnnounceDisposedResponse(m) => Some(m.secret_hash),
            Message::RemoveExpiredLock(m) => Some(m.secret_hash),
            _ => None,
        }
    }
}

/// A message plus its sender's identity and envelope signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    /// The message.
    pub message: Message,
    /// The sender's public key; the sender address derives from it.
    pub sender: PublicKey,
    /// Signature over the message's canonical serialization.
    pub signature: Signature,
}

impl SignedMessage {
    /// Sign a message.
    pub fn new(message: Message, keypair: &KeyPair) -> ProtoResult<Self> {
        let bytes = serialize(&message)?;
        Ok(SignedMessage {
            message,
            sender: keypair.public_key(),
            signature: sign(keypair.signing_key(), &bytes),
        })
    }

    /// Verify the envelope signature.
    pub fn verify_signature(&self) -> ProtoResult<()> {
        let bytes = serialize(&self.message)?;
        verify(&self.sender, &bytes, &self.signature).map_err(|_| ProtoError::InvalidSignature)
    }

    /// The sender's address.
    pub fn sender_address(&self) -> Address {
        hopnet_core::derive_address(&self.sender)
    }

    /// Echo hash: Keccak-256 of the packed message and the receiver's
    /// address. Identifies one delivery for acks and deduplication.
    pub fn echo_hash(&self, receiver: &Address) -> ProtoResult<[u8; 32]> {
        let bytes = serialize(self)?;
        Ok(keccak256_concat(&[bytes.as_slice(), receiver]))
    }

    /// Build the ack for this message, signed by the receiver.
    pub fn ack(&self, receiver: &KeyPair) -> ProtoResult<SignedMessage> {
        let receiver_address = hopnet_core::derive_address(&receiver.public_key());
        let echo_hash = self.echo_hash(&receiver_address)?;
        SignedMessage::new(Message::Ack(Ack { echo_hash }), receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_core::serialization::deserialize;

    fn keypair() -> KeyPair {
        KeyPair::generate()
    }

    fn ping() -> Message {
        Message::Ping(Ping { nonce: 7 })
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = keypair();
        let signed = SignedMessage::new(ping(), &kp).unwrap();
        signed.verify_signature().unwrap();
    }

    #[test]
    fn test_tampered_message_rejected() {
        let kp = keypair();
        let mut signed = SignedMessage::new(ping(), &kp).unwrap();
        signed.message = Message::Ping(Ping { nonce: 8 });
        assert!(matches!(
            signed.verify_signature(),
            Err(ProtoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wire_roundtrip() {
        let kp = keypair();
        let signed = SignedMessage::new(
            Message::SecretRequest(SecretRequest {
                payment_id: 3,
                secret_hash: [5u8; 32],
                amount: TokenAmount::from_u64(20),
            }),
            &kp,
        )
        .unwrap();

        let bytes = serialize(&signed).unwrap();
        let recovered: SignedMessage = deserialize(&bytes).unwrap();
        assert_eq!(signed, recovered);
        recovered.verify_signature().unwrap();
    }

    #[test]
    fn test_echo_hash_depends_on_receiver() {
        let kp = keypair();
        let signed = SignedMessage::new(ping(), &kp).unwrap();
        let h1 = signed.echo_hash(&[1u8; 20]).unwrap();
        let h2 = signed.echo_hash(&[2u8; 20]).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_ack_carries_echo_hash() {
        let sender = keypair();
        let receiver = keypair();
        let receiver_address = hopnet_core::derive_address(&receiver.public_key());

        let signed = SignedMessage::new(ping(), &sender).unwrap();
        let expected = signed.echo_hash(&receiver_address).unwrap();

        let ack = signed.ack(&receiver).unwrap();
        match ack.message {
            Message::Ack(Ack { echo_hash }) => assert_eq!(echo_hash, expected),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_ack_and_probes_skip_acking() {
        assert!(!ping().requires_ack());
        assert!(!Message::Ack(Ack { echo_hash: [0u8; 32] }).requires_ack());
        assert!(Message::RevealSecret(RevealSecret { secret: [1u8; 32] }).requires_ack());
    }

    #[test]
    fn test_secret_hash_of_reveal() {
        let secret = [3u8; 32];
        let message = Message::RevealSecret(RevealSecret { secret });
        assert_eq!(message.secret_hash(), Some(hopnet_core::keccak256(&secret)));
        assert_eq!(ping().secret_hash(), None);
    }

    #[test]
    fn test_binding_hashes_are_domain_separated() {
        // A disposed-response and an expired-lock removal over the same
        // channel and hashlock must not share a binding.
        let channel_id = [1u8; 32];
        let secret_hash = [2u8; 32];
        assert_ne!(
            disposed_response_binding(&channel_id, &secret_hash),
            remove_expired_binding(&channel_id, &secret_hash),
        );
    }

    #[test]
    fn test_binding_covers_message_fields() {
        let base = direct_transfer_binding(1, &[0xAA; 20], &[1u8; 20]);
        assert_ne!(base, direct_transfer_binding(2, &[0xAA; 20], &[1u8; 20]));
        assert_ne!(base, direct_transfer_binding(1, &[0xBB; 20], &[1u8; 20]));
        assert_ne!(base, direct_transfer_binding(1, &[0xAA; 20], &[2u8; 20]));
    }

    #[test]
    fn test_message_method_matches_free_function() {
        let kp = keypair();
        let message = DirectTransfer {
            payment_id: 7,
            token_address: [0xAA; 20],
            recipient: [1u8; 20],
            balance_proof: BalanceProof::new_signed(
                1,
                TokenAmount::from_u64(30),
                [0u8; 32],
                [3u8; 32],
                direct_transfer_binding(7, &[0xAA; 20], &[1u8; 20]),
                &kp,
            ),
        };
        assert_eq!(message.additional_hash(), message.balance_proof.additional_hash);
    }
}
