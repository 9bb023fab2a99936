//! Target state machine.
//!
//! The target asks the initiator for the secret, reveals it upstream so
//! the last hop releases the lock, and reports the payment received when
//! the unlock balance proof arrives. If the unlock stalls, the secret is
//! registered on chain while the lock is still claimable.

use serde::{Deserialize, Serialize};

use hopnet_core::{BlockNumber, Secret};

use super::change::{InitTarget, LockedTransferState, StateChange};
use super::event::Event;
use super::Transition;

/// State of one payment addressed to this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    /// The incoming transfer; its recipient is this node.
    pub from_transfer: LockedTransferState,
    /// Reveal timeout of the incoming channel.
    pub reveal_timeout: BlockNumber,
    /// The payment secret, once learned.
    pub secret: Option<Secret>,
    /// Whether the secret was revealed upstream.
    pub revealed_upstream: bool,
    /// Whether the secret was registered on chain.
    pub registered_on_chain: bool,
    /// Latest block seen by this machine.
    pub block: BlockNumber,
}

/// Apply one state change to the target machine.
pub fn state_transition(
    state: Option<TargetState>,
    change: &StateChange,
) -> Transition<TargetState> {
    match (state, change) {
        (None, StateChange::InitTarget(init)) => handle_init(init),
        (Some(state), StateChange::SecretRevealReceived { secret, .. }) => {
            handle_reveal(state, secret, false)
        }
        (Some(state), StateChange::RegistrySecretRevealed { secret, .. }) => {
            handle_reveal(state, secret, true)
        }
        (Some(state), StateChange::UnlockReceived { secret_hash, sender, .. }) => {
            handle_unlock(state, secret_hash, sender)
        }
        (Some(state), StateChange::Block { number }) => handle_block(state, *number),
        (state, _) => Transition::keep(state),
    }
}

fn handle_init(init: &InitTarget) -> Transition<TargetState> {
    let transfer = &init.from_transfer;
    let state = TargetState {
        from_transfer: transfer.clone(),
        reveal_timeout: init.reveal_timeout,
        secret: None,
        revealed_upstream: false,
        registered_on_chain: false,
        block: init.block_number,
    };
    // The amount requested is the locked amount: any fee budget left
    // over on the last hop belongs to the target.
    let event = Event::SendSecretRequest {
        recipient: transfer.initiator,
        payment_id: transfer.payment_id,
        amount: transfer.amount,
        secret_hash: transfer.secret_hash,
    };
    Transition::next(state, vec![event])
}

fn handle_reveal(
    mut state: TargetState,
    secret: &Secret,
    from_registry: bool,
) -> Transition<TargetState> {
    if hopnet_core::keccak256(secret) != state.from_transfer.secret_hash {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "revealed secret does not match hashlock".into() }],
        );
    }

    state.secret = Some(*secret);
    if from_registry {
        state.registered_on_chain = true;
        return Transition::keep(Some(state));
    }

    if state.revealed_upstream {
        return Transition::keep(Some(state));
    }
    state.revealed_upstream = true;
    let event = Event::SendRevealSecret {
        recipient: state.from_transfer.sender,
        secret: *secret,
        secret_hash: state.from_transfer.secret_hash,
    };
    Transition::next(state, vec![event])
}

fn handle_unlock(
    state: TargetState,
    secret_hash: &[u8; 32],
    sender: &[u8; 20],
) -> Transition<TargetState> {
    if *secret_hash != state.from_transfer.secret_hash
        || *sender != state.from_transfer.sender
    {
        return Transition::keep(Some(state));
    }
    Transition::done(vec![Event::TransferReceivedSuccess {
        payment_id: state.from_transfer.payment_id,
        initiator: state.from_transfer.initiator,
        amount: state.from_transfer.amount,
    }])
}

fn handle_block(mut state: TargetState, block: BlockNumber) -> Transition<TargetState> {
    state.block = state.block.max(block);
    let mut events = Vec::new();

    // The payer has not delivered the unlock and the deadline is one
    // reveal-timeout away: claim on chain while the lock is still valid.
    if let Some(secret) = state.secret {
        let deadline = state
            .from_transfer
            .expiration
            .saturating_sub(state.reveal_timeout);
        if !state.registered_on_chain && block >= deadline {
            state.registered_on_chain = true;
            events.push(Event::ContractRegisterSecret { secret });
            events.push(Event::ContractCloseChannel {
                channel_id: state.from_transfer.channel_id,
            });
        }
    }

    if block >= state.from_transfer.expiration {
        if state.registered_on_chain {
            // The lock is provable on chain; the claim continues there.
            return Transition::done(events);
        }
        events.push(Event::TransferReceivedFailed {
            payment_id: state.from_transfer.payment_id,
            reason: "lock expired before the secret arrived".into(),
        });
        return Transition::done(events);
    }

    Transition::next(state, events)
}
