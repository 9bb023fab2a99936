//! Mediated-transfer state machines.
//!
//! Three pure machines drive every payment: [`initiator`] for outgoing
//! payments, [`mediator`] for relayed ones and [`target`] for incoming
//! ones. A transition consumes one [`StateChange`] and produces the next
//! state plus a list of [`Event`]s; it never performs I/O and never
//! fails.

pub mod change;
pub mod event;
pub mod initiator;
pub mod mediator;
pub mod target;

pub use change::{
    InitInitiator, InitMediator, InitTarget, LockedTransferState, StateChange, TransferDescription,
};
pub use event::Event;
pub use initiator::InitiatorState;
pub use mediator::MediatorState;
pub use target::TargetState;

use serde::{Deserialize, Serialize};

use hopnet_core::{SecretHash, TokenAddress};

/// Result of one state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition<S> {
    /// The machine's next state; None once the machine is finished.
    pub new_state: Option<S>,
    /// Events to act on, in emission order.
    pub events: Vec<Event>,
}

impl<S> Transition<S> {
    /// Keep the given state, emitting nothing.
    pub fn keep(state: Option<S>) -> Self {
        Transition { new_state: state, events: Vec::new() }
    }

    /// Continue with a new state and events.
    pub fn next(state: S, events: Vec<Event>) -> Self {
        Transition { new_state: Some(state), events }
    }

    /// Finish the machine, emitting final events.
    pub fn done(events: Vec<Event>) -> Self {
        Transition { new_state: None, events }
    }
}

/// Which of the three machines drives a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRole {
    /// We started the payment.
    Initiator,
    /// We relay the payment.
    Mediator,
    /// The payment ends at this node.
    Target,
}

/// State of whichever machine drives a transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum TransferState {
    /// Initiator machine state.
    Initiator(InitiatorState),
    /// Mediator machine state.
    Mediator(MediatorState),
    /// Target machine state.
    Target(TargetState),
}

/// Drives one transfer end to end.
///
/// The manager is plain serializable data; snapshots persist it whole.
/// Dispatch is deterministic: the same state and the same state change
/// always produce the same events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateManager {
    /// Which machine this is.
    pub role: TransferRole,
    /// Machine state; None before Init and again after completion.
    pub state: Option<TransferState>,
    /// The hashlock identifying the transfer.
    pub secret_hash: SecretHash,
    /// The token being transferred.
    pub token_address: TokenAddress,
    finished: bool,
}

impl StateManager {
    /// Create a manager that has not yet consumed its Init.
    pub fn new(role: TransferRole, secret_hash: SecretHash, token_address: TokenAddress) -> Self {
        StateManager { role, state: None, secret_hash, token_address, finished: false }
    }

    /// Whether the machine has run to completion.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Apply a state change, returning the emitted events.
    pub fn dispatch(&mut self, change: &StateChange) -> Vec<Event> {
        if self.finished {
            return Vec::new();
        }
        let ran_before = self.state.is_some() || self.is_init_for_role(change);

        let events = match self.role {
            TransferRole::Initiator => {
                let state = match self.state.take() {
                    Some(TransferState::Initiator(s)) => Some(s),
                    _ => None,
                };
                let t = initiator::state_transition(state, change);
                self.state = t.new_state.map(TransferState::Initiator);
                t.events
            }
            TransferRole::Mediator => {
                let state = match self.state.take() {
                    Some(TransferState::Mediator(s)) => Some(s),
                    _ => None,
                };
                let t = mediator::state_transition(state, change);
                self.state = t.new_state.map(TransferState::Mediator);
                t.events
            }
            TransferRole::Target => {
                let state = match self.state.take() {
                    Some(TransferState::Target(s)) => Some(s),
                    _ => None,
                };
                let t = target::state_transition(state, change);
                self.state = t.new_state.map(TransferState::Target);
                t.events
            }
        };

        if ran_before && self.state.is_none() {
            self.finished = true;
        }
        events
    }

    fn is_init_for_role(&self, change: &StateChange) -> bool {
        matches!(
            (self.role, change),
            (TransferRole::Initiator, StateChange::InitInitiator(_))
                | (TransferRole::Mediator, StateChange::InitMediator(_))
                | (TransferRole::Target, StateChange::InitTarget(_))
        )
    }
}
