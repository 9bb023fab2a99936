//! Initiator state machine.
//!
//! Drives one outgoing payment: picks a route, sends the locked
//! transfer, answers the target's secret request, and settles the first
//! hop once the secret travels back. Refunds rotate to the next
//! candidate route; expiration fails the payment.

use serde::{Deserialize, Serialize};

use hopnet_core::BlockNumber;

use super::change::{InitInitiator, LockedTransferState, StateChange, TransferDescription};
use super::event::Event;
use super::Transition;
use crate::routing::{Route, RoutesState};

/// State of one payment being initiated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorState {
    /// The payment description, secret included.
    pub transfer: TransferDescription,
    /// Remaining route candidates.
    pub routes: RoutesState,
    /// The route currently in flight.
    pub route: Option<Route>,
    /// The locked transfer sent on the current route.
    pub sent_transfer: Option<LockedTransferState>,
    /// Whether the secret was already revealed to the target.
    pub revealed_to_target: bool,
    /// Whether the user cancelled the payment.
    pub canceled: bool,
    /// Latest block seen by this machine.
    pub block: BlockNumber,
}

impl InitiatorState {
    fn new(init: &InitInitiator) -> Self {
        InitiatorState {
            transfer: init.transfer.clone(),
            routes: init.routes.clone(),
            route: None,
            sent_transfer: None,
            revealed_to_target: false,
            canceled: false,
            block: init.block_number,
        }
    }

    /// Lock a transfer on the next viable route, if any.
    fn try_next_route(&mut self, block: BlockNumber) -> Option<Event> {
        let total = self.transfer.amount + self.transfer.fee;
        let route = self
            .routes
            .take_next(|r| r.available_balance >= total && r.settle_timeout > r.reveal_timeout)?;

        let locked = LockedTransferState {
            payment_id: self.transfer.payment_id,
            token_address: self.transfer.token_address,
            amount: total,
            fee: self.transfer.fee,
            initiator: self.transfer.initiator,
            target: self.transfer.target,
            expiration: block + route.settle_timeout,
            secret_hash: self.transfer.secret_hash,
            channel_id: route.channel_id,
            sender: self.transfer.initiator,
            recipient: route.next_hop,
        };
        self.sent_transfer = Some(locked.clone());
        self.route = Some(route);
        Some(Event::SendLockedTransfer { recipient: locked.recipient, transfer: locked })
    }
}

/// Apply one state change to the initiator machine.
pub fn state_transition(
    state: Option<InitiatorState>,
    change: &StateChange,
) -> Transition<InitiatorState> {
    match (state, change) {
        (None, StateChange::InitInitiator(init)) => handle_init(init),
        (Some(state), StateChange::RefundReceived { secret_hash, sender, channel_id }) => {
            handle_refund(state, secret_hash, sender, channel_id)
        }
        (Some(state), StateChange::SecretRequestReceived { payment_id, amount, secret_hash, .. }) => {
            handle_secret_request(state, *payment_id, amount, secret_hash)
        }
        (Some(state), StateChange::SecretRevealReceived { secret, .. }) => {
            handle_reveal(state, secret)
        }
        (Some(state), StateChange::RegistrySecretRevealed { secret, .. }) => {
            handle_reveal(state, secret)
        }
        (Some(state), StateChange::CancelPayment { payment_id }) => {
            handle_cancel(state, *payment_id)
        }
        (Some(state), StateChange::Block { number }) => handle_block(state, *number),
        (state, _) => Transition::keep(state),
    }
}

fn handle_init(init: &InitInitiator) -> Transition<InitiatorState> {
    let mut state = InitiatorState::new(init);
    match state.try_next_route(init.block_number) {
        Some(event) => Transition::next(state, vec![event]),
        None => Transition::done(vec![Event::TransferSentFailed {
            payment_id: init.transfer.payment_id,
            reason: "no usable route".into(),
        }]),
    }
}

fn handle_refund(
    mut state: InitiatorState,
    secret_hash: &[u8; 32],
    sender: &[u8; 20],
    channel_id: &[u8; 32],
) -> Transition<InitiatorState> {
    if *secret_hash != state.transfer.secret_hash {
        return Transition::keep(Some(state));
    }
    let in_flight = match (&state.route, &state.sent_transfer) {
        (Some(route), Some(sent)) => route.next_hop == *sender && sent.channel_id == *channel_id,
        _ => false,
    };
    if !in_flight {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "refund from an unexpected hop".into() }],
        );
    }
    if state.revealed_to_target {
        // Too late to abandon: the target can already claim the lock.
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "refund after secret was revealed".into() }],
        );
    }

    // Drop the refunded lock on the old route.
    let mut events = vec![Event::SendAnnounceDisposedResponse {
        recipient: *sender,
        channel_id: *channel_id,
        secret_hash: *secret_hash,
    }];
    state.route = None;
    state.sent_transfer = None;

    if state.canceled {
        return Transition::done(events);
    }

    let block = state.block;
    match state.try_next_route(block) {
        Some(event) => {
            events.push(event);
            Transition::next(state, events)
        }
        None => {
            events.push(Event::TransferSentFailed {
                payment_id: state.transfer.payment_id,
                reason: "no route left after refund".into(),
            });
            Transition::done(events)
        }
    }
}

fn handle_secret_request(
    mut state: InitiatorState,
    payment_id: u64,
    amount: &hopnet_core::TokenAmount,
    secret_hash: &[u8; 32],
) -> Transition<InitiatorState> {
    let matches = payment_id == state.transfer.payment_id
        && *secret_hash == state.transfer.secret_hash
        && *amount == state.transfer.amount;
    if !matches {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "secret request does not match payment".into() }],
        );
    }
    if state.canceled {
        return Transition::keep(Some(state));
    }
    if state.revealed_to_target {
        // Duplicate request; the reveal was already sent.
        return Transition::keep(Some(state));
    }
    let secret = match state.transfer.secret {
        Some(secret) => secret,
        // A swap taker holds no secret and cannot answer.
        None => return Transition::keep(Some(state)),
    };

    state.revealed_to_target = true;
    let event = Event::SendRevealSecret {
        recipient: state.transfer.target,
        secret,
        secret_hash: state.transfer.secret_hash,
    };
    Transition::next(state, vec![event])
}

fn handle_reveal(state: InitiatorState, secret: &[u8; 32]) -> Transition<InitiatorState> {
    if hopnet_core::keccak256(secret) != state.transfer.secret_hash {
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "revealed secret does not match hashlock".into() }],
        );
    }
    let (next_hop, channel_id) = match &state.route {
        Some(route) => (route.next_hop, route.channel_id),
        None => return Transition::keep(Some(state)),
    };

    // The next hop knows the secret: release the first-hop lock and
    // report success. The machine is finished.
    Transition::done(vec![
        Event::SendUnlock {
            recipient: next_hop,
            channel_id,
            secret_hash: state.transfer.secret_hash,
            payment_id: state.transfer.payment_id,
        },
        Event::TransferSentSuccess {
            payment_id: state.transfer.payment_id,
            target: state.transfer.target,
        },
    ])
}

fn handle_cancel(mut state: InitiatorState, payment_id: u64) -> Transition<InitiatorState> {
    if payment_id != state.transfer.payment_id || state.canceled {
        return Transition::keep(Some(state));
    }
    if state.revealed_to_target {
        // The secret is out; the payment can complete regardless.
        return Transition::next(
            state,
            vec![Event::InvalidReceived { reason: "cancel after secret was revealed".into() }],
        );
    }
    state.canceled = true;
    // The in-flight lock is left to expire; the failure is reported now.
    Transition::next(
        state,
        vec![Event::TransferSentFailed { payment_id, reason: "payment cancelled".into() }],
    )
}

fn handle_block(mut state: InitiatorState, block: BlockNumber) -> Transition<InitiatorState> {
    state.block = state.block.max(block);
    let expired = state
        .sent_transfer
        .as_ref()
        .map(|sent| block >= sent.expiration)
        .unwrap_or(false);
    if !expired {
        return Transition::keep(Some(state));
    }
    let sent = state.sent_transfer.as_ref().unwrap();
    let mut events = vec![Event::SendRemoveExpiredLock {
        recipient: sent.recipient,
        channel_id: sent.channel_id,
        secret_hash: sent.secret_hash,
    }];
    if !state.revealed_to_target {
        events.push(Event::TransferSentFailed {
            payment_id: state.transfer.payment_id,
            reason: "lock expired".into(),
        });
    } else {
        // The target never came back for the unlock; it can still claim
        // on chain if it registered the secret in time.
        events.push(Event::TransferSentFailed {
            payment_id: state.transfer.payment_id,
            reason: "lock expired after reveal".into(),
        });
    }
    Transition::done(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_core::{keccak256, TokenAmount};

    fn addr(tag: u8) -> [u8; 20] {
        [tag; 20]
    }

    fn route(tag: u8, balance: u64) -> Route {
        Route {
            next_hop: addr(tag),
            channel_id: [tag; 32],
            available_balance: TokenAmount::from_u64(balance),
            settle_timeout: 500,
            reveal_timeout: 30,
            fee: TokenAmount::zero(),
            hops: 2,
            last_seen: 0,
        }
    }

    fn init(routes: Vec<Route>) -> InitInitiator {
        let secret = [9u8; 32];
        InitInitiator {
            transfer: TransferDescription {
                payment_id: 1,
                token_address: [0xAA; 20],
                amount: TokenAmount::from_u64(20),
                fee: TokenAmount::zero(),
                initiator: addr(1),
                target: addr(4),
                secret: Some(secret),
                secret_hash: keccak256(&secret),
            },
            routes: RoutesState::new(routes),
            block_number: 10,
        }
    }

    fn started(routes: Vec<Route>) -> (InitiatorState, Vec<Event>) {
        let t = state_transition(None, &StateChange::InitInitiator(init(routes)));
        (t.new_state.unwrap(), t.events)
    }

    #[test]
    fn test_init_sends_on_first_viable_route() {
        let (state, events) = started(vec![route(2, 100), route(3, 100)]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::SendLockedTransfer { recipient, transfer } => {
                assert_eq!(*recipient, addr(2));
                assert_eq!(transfer.expiration, 510);
                assert_eq!(transfer.amount, TokenAmount::from_u64(20));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(state.route.as_ref().unwrap().next_hop, addr(2));
    }

    #[test]
    fn test_init_skips_underfunded_route() {
        let (_, events) = started(vec![route(2, 5), route(3, 100)]);
        match &events[0] {
            Event::SendLockedTransfer { recipient, .. } => assert_eq!(*recipient, addr(3)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_init_without_routes_fails() {
        let t = state_transition(None, &StateChange::InitInitiator(init(vec![])));
        assert!(t.new_state.is_none());
        assert!(matches!(t.events[0], Event::TransferSentFailed { .. }));
    }

    #[test]
    fn test_refund_rotates_to_next_route() {
        let (state, _) = started(vec![route(2, 100), route(3, 100)]);
        let secret_hash = state.transfer.secret_hash;

        let t = state_transition(
            Some(state),
            &StateChange::RefundReceived {
                secret_hash,
                channel_id: [2; 32],
                sender: addr(2),
            },
        );
        let events = t.events;
        assert!(matches!(events[0], Event::SendAnnounceDisposedResponse { recipient, .. } if recipient == addr(2)));
        assert!(matches!(&events[1], Event::SendLockedTransfer { recipient, .. } if *recipient == addr(3)));
        assert_eq!(t.new_state.unwrap().route.unwrap().next_hop, addr(3));
    }

    #[test]
    fn test_refund_with_no_route_left_fails() {
        let (state, _) = started(vec![route(2, 100)]);
        let secret_hash = state.transfer.secret_hash;

        let t = state_transition(
            Some(state),
            &StateChange::RefundReceived {
                secret_hash,
                channel_id: [2; 32],
                sender: addr(2),
            },
        );
        assert!(t.new_state.is_none());
        assert!(t
            .events
            .iter()
            .any(|e| matches!(e, Event::TransferSentFailed { .. })));
    }

    #[test]
    fn test_refund_from_wrong_hop_flagged() {
        let (state, _) = started(vec![route(2, 100)]);
        let secret_hash = state.transfer.secret_hash;

        let t = state_transition(
            Some(state),
            &StateChange::RefundReceived {
                secret_hash,
                channel_id: [7; 32],
                sender: addr(7),
            },
        );
        assert!(t.new_state.is_some());
        assert!(matches!(t.events[0], Event::InvalidReceived { .. }));
    }

    #[test]
    fn test_secret_request_reveals_once() {
        let (state, _) = started(vec![route(2, 100)]);
        let request = StateChange::SecretRequestReceived {
            payment_id: 1,
            amount: TokenAmount::from_u64(20),
            secret_hash: state.transfer.secret_hash,
            sender: addr(4),
        };

        let t = state_transition(Some(state), &request);
        assert!(matches!(
            t.events[0],
            Event::SendRevealSecret { recipient, .. } if recipient == addr(4)
        ));

        // A duplicate request is absorbed silently.
        let t = state_transition(t.new_state, &request);
        assert!(t.events.is_empty());
        assert!(t.new_state.unwrap().revealed_to_target);
    }

    #[test]
    fn test_secret_request_with_wrong_amount_flagged() {
        let (state, _) = started(vec![route(2, 100)]);
        let t = state_transition(
            Some(state),
            &StateChange::SecretRequestReceived {
                payment_id: 1,
                amount: TokenAmount::from_u64(19),
                secret_hash: [0xEE; 32],
                sender: addr(4),
            },
        );
        assert!(matches!(t.events[0], Event::InvalidReceived { .. }));
        assert!(!t.new_state.unwrap().revealed_to_target);
    }

    #[test]
    fn test_reveal_completes_payment() {
        let (state, _) = started(vec![route(2, 100)]);
        let secret = state.transfer.secret.unwrap();

        let t = state_transition(
            Some(state),
            &StateChange::SecretRevealReceived { secret, sender: addr(2) },
        );
        assert!(t.new_state.is_none());
        assert!(matches!(
            t.events[0],
            Event::SendUnlock { recipient, .. } if recipient == addr(2)
        ));
        assert!(matches!(t.events[1], Event::TransferSentSuccess { .. }));
    }

    #[test]
    fn test_registry_reveal_completes_payment() {
        let (state, _) = started(vec![route(2, 100)]);
        let secret = state.transfer.secret.unwrap();
        let secret_hash = state.transfer.secret_hash;

        let t = state_transition(
            Some(state),
            &StateChange::RegistrySecretRevealed { secret, secret_hash, block_number: 50 },
        );
        assert!(t.new_state.is_none());
        assert!(t.events.iter().any(|e| matches!(e, Event::TransferSentSuccess { .. })));
    }

    #[test]
    fn test_wrong_secret_flagged() {
        let (state, _) = started(vec![route(2, 100)]);
        let t = state_transition(
            Some(state),
            &StateChange::SecretRevealReceived { secret: [0xEE; 32], sender: addr(2) },
        );
        assert!(t.new_state.is_some());
        assert!(matches!(t.events[0], Event::InvalidReceived { .. }));
    }

    #[test]
    fn test_expiration_fails_payment() {
        let (state, _) = started(vec![route(2, 100)]);

        let t = state_transition(Some(state), &StateChange::Block { number: 509 });
        let state = t.new_state.expect("not yet expired");
        assert!(t.events.is_empty());

        let t = state_transition(Some(state), &StateChange::Block { number: 510 });
        assert!(t.new_state.is_none());
        assert!(matches!(t.events[0], Event::SendRemoveExpiredLock { .. }));
        assert!(matches!(t.events[1], Event::TransferSentFailed { .. }));
    }

    #[test]
    fn test_cancel_stops_retries() {
        let (state, _) = started(vec![route(2, 100), route(3, 100)]);
        let secret_hash = state.transfer.secret_hash;

        let t = state_transition(Some(state), &StateChange::CancelPayment { payment_id: 1 });
        assert!(matches!(t.events[0], Event::TransferSentFailed { .. }));

        // A refund after cancellation disposes the lock but does not retry.
        let t = state_transition(
            t.new_state,
            &StateChange::RefundReceived {
                secret_hash,
                channel_id: [2; 32],
                sender: addr(2),
            },
        );
        assert!(t.new_state.is_none());
        assert!(!t
            .events
            .iter()
            .any(|e| matches!(e, Event::SendLockedTransfer { .. })));
    }
}
