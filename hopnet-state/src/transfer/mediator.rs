//! Mediator state machine.
//!
//! A mediator pairs an incoming locked transfer (from the payer) with an
//! outgoing one (to the payee), relays the secret back toward the
//! initiator, and guards its own margin: the outgoing lock always
//! expires one reveal-timeout before the incoming one, and if the payer
//! never delivers the unlock the secret is registered on chain while the
//! incoming lock is still claimable.

use serde::{Deserialize, Serialize};

use hopnet_core::{BlockNumber, Secret, TokenAmount};

use super::change::{InitMediator, LockedTransferState, StateChange};
use super::event::Event;
use super::Transition;
use crate::routing::RoutesState;

/// State of one mediation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatorState {
    /// The incoming transfer; its recipient is this node.
    pub payer_transfer: LockedTransferState,
    /// Reveal timeout of the incoming channel; the margin the node
    /// needs between learning the secret and the incoming deadline.
    pub payer_reveal_timeout: BlockNumber,
    /// Remaining forwarding candidates.
    pub routes: RoutesState,
    /// Fee this node keeps.
    pub our_fee: TokenAmount,
    /// The outgoing transfer currently in flight, if any.
    pub payee_transfer: Option<LockedTransferState>,
    /// Whether the outgoing lock expired unused.
    pub payee_expired: bool,
    /// The payment secret, once learned.
    pub secret: Option<Secret>,
    /// Whether the secret was already revealed to the payer.
    pub reveal_sent_to_payer: bool,
    /// Whether the unlock was sent to the payee.
    pub balance_proof_sent: bool,
    /// Whether the unlock arrived from the payer.
    pub balance_proof_received: bool,
    /// Whether the secret was registered on chain (by us or anyone).
    pub registered_on_chain: bool,
    /// Latest block seen by this machine.
    pub block: BlockNumber,
}

impl MediatorState {
    fn new(init: &InitMediator) -> Self {
        MediatorState {
            payer_transfer: init.from_transfer.clone(),
            payer_reveal_timeout: init.payer_reveal_timeout,
            routes: init.routes.clone(),
            our_fee: init.our_fee,
            payee_transfer: None,
            payee_expired: false,
            secret: None,
            reveal_sent_to_payer: false,
            balance_proof_sent: false,
            balance_proof_received: false,
            registered_on_chain: false,
            block: init.block_number,
        }
    }

    /// Whether both sides of the pair are settled.
    fn is_complete(&self) -> bool {
        self.balance_proof_received
            && (self.balance_proof_sent || self.payee_transfer.is_none() || self.payee_expired)
    }

    /// Forward on the next viable route, if any.
    fn try_forward(&mut self) -> Option<Event> {
        if self.our_fee > self.payer_transfer.fee {
            // Not enough fee budget left for this hop.
            return None;
        }
        let amount_out = self.payer_transfer.amount - self.our_fee;
        let expiration_in = self.payer_transfer.expiration;
        let block = self.block;

        let route = self.routes.take_next(|r| {
            let expiration_out = expiration_in.saturating_sub(r.reveal_timeout);
            r.available_balance >= amount_out && expiration_out > block + r.reveal_timeout
        })?;

        let out = LockedTransferState {
            payment_id: self.payer_transfer.payment_id,
            token_address: self.payer_transfer.token_address,
            amount: amount_out,
            fee: self.payer_transfer.fee - self.our_fee,
            initiator: self.payer_transfer.initiator,
            target: self.payer_transfer.target,
            expiration: expiration_in - route.reveal_timeout,
            secret_hash: self.payer_transfer.secret_hash,
            channel_id: route.channel_id,
            sender: self.payer_transfer.recipient,
            recipient: route.next_hop,
        };
        self.payee_transfer = Some(out.clone());
        self.payee_expired = false;
        Some(Event::SendLockedTransfer { recipient: out.recipient, transfer: out })
    }

    /// The refusal toward the payer: give the incoming lock up.
    fn refuse(&self) -> Event {
        Event::SendAnnounceDisposed {
            recipient: self.payer_transfer.sender,
            channel_id: self.payer_transfer.channel_id,
            secret_hash: self.payer_transfer.secret_hash,
        }
    }
}

/// Apply one state change to the mediator machine.
pub fn state_transition(
    state: Option<MediatorState>,
    change: &StateChange,
) -> Transition<MediatorState> {
    match (state, change) {
        (None, StateChange::InitMediator(init)) => handle_init(init),
        (Some(state), StateChange::RefundReceived { secret_hash, sender, channel_id }) => {
            handle_refund(state, secret_hash, sender, channel_id)
        }
        (Some(state), StateChange::SecretRequestReceived { payment_id, amount, secret_hash, .. }) => {
            handle_secret_request(state, *payment_id, amount, secret_hash)
        }
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

fn handle_init(init: &InitMediator) -> Transition<MediatorState> {
    let mut state = MediatorState::new(init);
    match state.try_forward() {
        Some(event) => Transition::next(state, vec![event]),
        None => {
            let refuse = state.refuse();
            Transition::done(vec![refuse])
        }
    }
}

fn handle_refund(
    mut state: MediatorState,
    secret_hash: &[u8; 32],
    sender: &[u8; 20],
    channel_id: &[u8; 32],
) -> Transition<MediatorState> {
    if *secret_hash != state.payer_transfer.secret_hash {
        return Transition::keep(Some(state));
    }
    let from_payee = state
        .payee_transfer
        .as_ref()
        .map(|out| out.recipient == *sender && out.channel_id == *channel_id)
        .unwrap_or(false);
    if !from_payee {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "refund from an unexpected hop".into() }],
        );
    }
    if state.secret.is_some() {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "refund after secret was revealed".into() }],
        );
    }

    let mut events = vec![Event::SendAnnounceDisposedResponse {
        recipient: *sender,
        channel_id: *channel_id,
        secret_hash: *secret_hash,
    }];
    state.payee_transfer = None;

    match state.try_forward() {
        Some(event) => {
            events.push(event);
            Transition::next(state, events)
        }
        None => {
            events.push(state.refuse());
            Transition::done(events)
        }
    }
}

fn handle_secret_request(
    state: MediatorState,
    payment_id: u64,
    amount: &TokenAmount,
    secret_hash: &[u8; 32],
) -> Transition<MediatorState> {
    if *secret_hash != state.payer_transfer.secret_hash {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "secret request for an unknown payment".into() }],
        );
    }
    // Relayed unchanged toward the initiator along the pair.
    let event = Event::SendSecretRequest {
        recipient: state.payer_transfer.sender,
        payment_id,
        amount: *amount,
        secret_hash: *secret_hash,
    };
    Transition::next(state, vec![event])
}

fn handle_reveal(
    mut state: MediatorState,
    secret: &Secret,
    from_registry: bool,
) -> Transition<MediatorState> {
    if hopnet_core::keccak256(secret) != state.payer_transfer.secret_hash {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "revealed secret does not match hashlock".into() }],
        );
    }

    state.secret = Some(*secret);
    if from_registry {
        state.registered_on_chain = true;
    }

    let mut events = Vec::new();
    // Reveal toward the initiator so the payer releases our lock. The
    // registry counts as a reveal everyone sees, so it is skipped there.
    if !from_registry && !state.reveal_sent_to_payer {
        state.reveal_sent_to_payer = true;
        events.push(Event::SendRevealSecret {
            recipient: state.payer_transfer.sender,
            secret: *secret,
            secret_hash: state.payer_transfer.secret_hash,
        });
    }
    // Release the outgoing lock: the payee earned it.
    if !state.balance_proof_sent && !state.payee_expired {
        if let Some(out) = &state.payee_transfer {
            state.balance_proof_sent = true;
            events.push(Event::SendUnlock {
                recipient: out.recipient,
                channel_id: out.channel_id,
                secret_hash: out.secret_hash,
                payment_id: out.payment_id,
            });
        }
    }

    if state.is_complete() {
        Transition::done(events)
    } else {
        Transition::next(state, events)
    }
}

fn handle_unlock(
    mut state: MediatorState,
    secret_hash: &[u8; 32],
    sender: &[u8; 20],
) -> Transition<MediatorState> {
    if *secret_hash != state.payer_transfer.secret_hash
        || *sender != state.payer_transfer.sender
    {
        return Transition::keep(Some(state));
    }
    state.balance_proof_received = true;
    if state.is_complete() {
        Transition::done(vec![])
    } else {
        Transition::keep(Some(state))
    }
}

fn handle_block(mut state: MediatorState, block: BlockNumber) -> Transition<MediatorState> {
    state.block = state.block.max(block);
    let mut events = Vec::new();

    // Outgoing lock expired unused: clean up our tree.
    if state.secret.is_none() && !state.payee_expired {
        if let Some(out) = &state.payee_transfer {
            if block >= out.expiration {
                events.push(Event::SendRemoveExpiredLock {
                    recipient: out.recipient,
                    channel_id: out.channel_id,
                    secret_hash: out.secret_hash,
                });
                state.payee_expired = true;
            }
        }
    }

    // The off-chain path became unsafe: the payer has not delivered the
    // unlock and the incoming deadline is one reveal-timeout away.
    // Publish the secret and close the incoming channel to claim on
    // chain.
    if let Some(secret) = state.secret {
        let deadline = state
            .payer_transfer
            .expiration
            .saturating_sub(state.payer_reveal_timeout);
        if !state.balance_proof_received && !state.registered_on_chain && block >= deadline {
            state.registered_on_chain = true;
            events.push(Event::ContractRegisterSecret { secret });
            events.push(Event::ContractCloseChannel {
                channel_id: state.payer_transfer.channel_id,
            });
        }
    }

    // Incoming lock expired with no secret: the mediation is dead.
    if state.secret.is_none() && block >= state.payer_transfer.expiration {
        return Transition::done(events);
    }
    // On-chain claim in progress; nothing further happens off chain.
    if state.registered_on_chain && block >= state.payer_transfer.expiration {
        return Transition::done(events);
    }

    Transition::next(state, events)
}
