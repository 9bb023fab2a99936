//! Events: the only outputs the state machines produce.
//!
//! `Send*` events become signed wire messages, `Contract*` events become
//! on-chain transactions, and the remaining variants report payment
//! outcomes to the user API. All of them are persisted to the event log
//! before any side effect runs.

use serde::{Deserialize, Serialize};

use hopnet_core::{Address, ChannelId, Secret, SecretHash, TokenAmount};

use super::change::LockedTransferState;

/// Outputs of a state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Send a locked (mediated) transfer to the next hop.
    SendLockedTransfer {
        /// Receiving hop.
        recipient: Address,
        /// The hop transfer to put on the wire.
        transfer: LockedTransferState,
    },
    /// Ask the initiator for the payment secret.
    SendSecretRequest {
        /// Receiving node (the initiator).
        recipient: Address,
        /// Payment the request is about.
        payment_id: u64,
        /// Amount we expect to receive.
        amount: TokenAmount,
        /// Hashlock of the payment.
        secret_hash: SecretHash,
    },
    /// Reveal a payment secret to a peer.
    SendRevealSecret {
        /// Receiving node.
        recipient: Address,
        /// The secret.
        secret: Secret,
        /// Its hash, for routing the message to the right machine.
        secret_hash: SecretHash,
    },
    /// Deliver the unlock balance proof for a claimable lock.
    SendUnlock {
        /// Receiving hop (the lock's payee).
        recipient: Address,
        /// Channel the lock lives on.
        channel_id: ChannelId,
        /// Hashlock being settled.
        secret_hash: SecretHash,
        /// Payment identifier.
        payment_id: u64,
    },
    /// Give up a lock we received; it must never be redeemed.
    SendAnnounceDisposed {
        /// The lock's payer.
        recipient: Address,
        /// Channel the lock lives on.
        channel_id: ChannelId,
        /// Hashlock of the abandoned lock.
        secret_hash: SecretHash,
    },
    /// Remove our own lock after its payee announced disposal.
    SendAnnounceDisposedResponse {
        /// The disposing hop.
        recipient: Address,
        /// Channel the lock lives on.
        channel_id: ChannelId,
        /// Hashlock of the removed lock.
        secret_hash: SecretHash,
    },
    /// Remove an expired lock from our tree.
    SendRemoveExpiredLock {
        /// The lock's payee.
        recipient: Address,
        /// Channel the lock lives on.
        channel_id: ChannelId,
        /// Hashlock of the expired lock.
        secret_hash: SecretHash,
    },
    /// Publish a secret in the on-chain registry.
    ContractRegisterSecret {
        /// The secret to publish.
        secret: Secret,
    },
    /// Close a channel on chain with the latest partner proof.
    ContractCloseChannel {
        /// Channel to close.
        channel_id: ChannelId,
    },
    /// An outgoing payment completed.
    TransferSentSuccess {
        /// The payment.
        payment_id: u64,
        /// Its target.
        target: Address,
    },
    /// An outgoing payment failed.
    TransferSentFailed {
        /// The payment.
        payment_id: u64,
        /// Why it failed.
        reason: String,
    },
    /// An incoming payment completed.
    TransferReceivedSuccess {
        /// The payment.
        payment_id: u64,
        /// The original payer.
        initiator: Address,
        /// Amount received.
        amount: TokenAmount,
    },
    /// An incoming payment failed.
    TransferReceivedFailed {
        /// The payment.
        payment_id: u64,
        /// Why it failed.
        reason: String,
    },
    /// A received message violated a protocol invariant; recorded for
    /// operator review, never acted upon.
    InvalidReceived {
        /// What was wrong.
        reason: String,
    },
}

impl Event {
    /// Whether this event reports a terminal payment outcome.
    pub fn is_transfer_outcome(&self) -> bool {
        matches!(
            self,
            Event::TransferSentSuccess { .. }
                | Event::TransferSentFailed { .. }
                | Event::TransferReceivedSuccess { .. }
                | Event::TransferReceivedFailed { .. }
        )
    }
}
