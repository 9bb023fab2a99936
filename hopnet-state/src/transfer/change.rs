//! State changes: the only inputs the state machines consume.
//!
//! Every variant is serializable because the write-ahead log persists
//! each state change before it is dispatched. Anything non-deterministic
//! (the payment secret, the route order, the current block) is captured
//! in the payload so replay is exact.

use serde::{Deserialize, Serialize};

use hopnet_core::{
    Address, BlockNumber, ChannelId, Secret, SecretHash, TokenAddress, TokenAmount,
};

use crate::routing::RoutesState;

/// Description of a payment the initiator wants to make.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescription {
    /// Caller-chosen payment identifier.
    pub payment_id: u64,
    /// Token being transferred.
    pub token_address: TokenAddress,
    /// Amount the target should receive.
    pub amount: TokenAmount,
    /// Total fee budget for mediating nodes.
    pub fee: TokenAmount,
    /// The paying node.
    pub initiator: Address,
    /// The receiving node.
    pub target: Address,
    /// The payment secret. None for a swap taker, who locks against a
    /// hashlock chosen by the counter-party and never reveals.
    pub secret: Option<Secret>,
    /// Keccak-256 of the secret; the payment's identity across hops.
    pub secret_hash: SecretHash,
}

/// A locked transfer as seen on one hop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedTransferState {
    /// Payment identifier, propagated unchanged across hops.
    pub payment_id: u64,
    /// Token being transferred.
    pub token_address: TokenAddress,
    /// Amount locked on this hop.
    pub amount: TokenAmount,
    /// Remaining fee budget for hops further downstream.
    pub fee: TokenAmount,
    /// The original payer.
    pub initiator: Address,
    /// The final recipient.
    pub target: Address,
    /// Block after which the hop's lock expires.
    pub expiration: BlockNumber,
    /// The payment's hashlock.
    pub secret_hash: SecretHash,
    /// Channel carrying the hop.
    pub channel_id: ChannelId,
    /// The hop's payer.
    pub sender: Address,
    /// The hop's payee.
    pub recipient: Address,
}

/// Initiator start: everything the machine needs, including the fresh
/// secret and the route order, so replay is deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitInitiator {
    /// The payment to make.
    pub transfer: TransferDescription,
    /// Candidate routes in try-order.
    pub routes: RoutesState,
    /// Block at which the payment was started.
    pub block_number: BlockNumber,
}

/// Mediator start: the incoming transfer plus forwarding candidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMediator {
    /// The transfer received from the payer.
    pub from_transfer: LockedTransferState,
    /// Reveal timeout of the channel the transfer arrived on.
    pub payer_reveal_timeout: BlockNumber,
    /// Candidate routes toward the target, payer and initiator excluded.
    pub routes: RoutesState,
    /// Fee this node charges for mediating.
    pub our_fee: TokenAmount,
    /// Block at which the transfer arrived.
    pub block_number: BlockNumber,
}

/// Target start: the incoming transfer that ends at this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTarget {
    /// The transfer received from the last mediator.
    pub from_transfer: LockedTransferState,
    /// Reveal timeout of the channel the transfer arrived on.
    pub reveal_timeout: BlockNumber,
    /// Block at which the transfer arrived.
    pub block_number: BlockNumber,
}

/// All inputs the state machines and the channel projection consume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChange {
    /// Start an outgoing payment as initiator.
    InitInitiator(InitInitiator),
    /// Mediate a received transfer.
    InitMediator(InitMediator),
    /// Receive a transfer addressed to us.
    InitTarget(InitTarget),
    /// A new block was mined; the protocol's clock tick.
    Block {
        /// The new chain height.
        number: BlockNumber,
    },
    /// The target asked for the payment secret.
    SecretRequestReceived {
        /// Payment the request is about.
        payment_id: u64,
        /// Amount the requester claims to expect.
        amount: TokenAmount,
        /// Hashlock of the payment.
        secret_hash: SecretHash,
        /// Message sender.
        sender: Address,
    },
    /// A peer revealed a payment secret off chain.
    SecretRevealReceived {
        /// The revealed secret.
        secret: Secret,
        /// Message sender.
        sender: Address,
    },
    /// The payer of a hop delivered the unlock balance proof.
    UnlockReceived {
        /// Hashlock of the settled lock.
        secret_hash: SecretHash,
        /// Channel the unlock was registered on.
        channel_id: ChannelId,
        /// Message sender.
        sender: Address,
    },
    /// A payee gave up a lock we sent (announce-disposed arrived).
    RefundReceived {
        /// Hashlock of the abandoned lock.
        secret_hash: SecretHash,
        /// Channel the lock lives on.
        channel_id: ChannelId,
        /// The refunding hop.
        sender: Address,
    },
    /// The user cancelled a pending payment.
    CancelPayment {
        /// Payment to cancel.
        payment_id: u64,
    },
    /// A received message violated a protocol invariant and was
    /// dropped. Recorded for operator review; no machine consumes it.
    InvalidMessageReceived {
        /// What was wrong.
        reason: String,
    },
    /// The on-chain secret registry published a preimage.
    RegistrySecretRevealed {
        /// The published secret.
        secret: Secret,
        /// Its hash.
        secret_hash: SecretHash,
        /// Block of the registration.
        block_number: BlockNumber,
    },
    /// A channel-opened event was confirmed on chain.
    ContractChannelOpened {
        /// New channel identifier.
        channel_id: ChannelId,
        /// Token network the channel belongs to.
        token_address: TokenAddress,
        /// One participant.
        participant1: Address,
        /// The other participant.
        participant2: Address,
        /// Channel settle timeout.
        settle_timeout: BlockNumber,
        /// Block of the event.
        block_number: BlockNumber,
    },
    /// A deposit was confirmed on chain.
    ContractDeposit {
        /// Channel the deposit is for.
        channel_id: ChannelId,
        /// Depositing participant.
        participant: Address,
        /// New total deposit of that participant.
        total_deposit: TokenAmount,
        /// Block of the event.
        block_number: BlockNumber,
    },
    /// A channel close was confirmed on chain.
    ContractChannelClosed {
        /// The closed channel.
        channel_id: ChannelId,
        /// Participant who closed.
        closing_participant: Address,
        /// Block of the event.
        block_number: BlockNumber,
    },
    /// A channel settlement was confirmed on chain.
    ContractChannelSettled {
        /// The settled channel.
        channel_id: ChannelId,
        /// Block of the event.
        block_number: BlockNumber,
    },
    /// A withdraw was confirmed on chain.
    ContractWithdraw {
        /// Channel the withdraw happened on.
        channel_id: ChannelId,
        /// Withdrawing participant.
        participant: Address,
        /// New total withdrawn amount of that participant.
        total_withdrawn: TokenAmount,
        /// Block of the event.
        block_number: BlockNumber,
    },
}

impl StateChange {
    /// The hashlock this state change is about, when it targets a
    /// specific transfer.
    pub fn secret_hash(&self) -> Option<SecretHash> {
        match self {
            StateChange::InitInitiator(init) => Some(init.transfer.secret_hash),
            StateChange::InitMediator(init) => Some(init.from_transfer.secret_hash),
            StateChange::InitTarget(init) => Some(init.from_transfer.secret_hash),
            StateChange::SecretRequestReceived { secret_hash, .. }
            | StateChange::UnlockReceived { secret_hash, .. }
            | StateChange::RefundReceived { secret_hash, .. }
            | StateChange::RegistrySecretRevealed { secret_hash, .. } => Some(*secret_hash),
            StateChange::SecretRevealReceived { secret, .. } => {
                Some(hopnet_core::keccak256(secret))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_core::keccak256;

    #[test]
    fn test_secret_hash_extraction() {
        let secret = [1u8; 32];
        let change = StateChange::SecretRevealReceived { secret, sender: [2u8; 20] };
        assert_eq!(change.secret_hash(), Some(keccak256(&secret)));

        let change = StateChange::Block { number: 5 };
        assert_eq!(change.secret_hash(), None);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let change = StateChange::RefundReceived {
            secret_hash: [5u8; 32],
            channel_id: [6u8; 32],
            sender: [7u8; 20],
        };
        let bytes = hopnet_core::serialization::serialize(&change).unwrap();
        let recovered: StateChange = hopnet_core::serialization::deserialize(&bytes).unwrap();
        assert_eq!(change, recovered);
    }
}
