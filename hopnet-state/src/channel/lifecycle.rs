//! Channel lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle states of a channel.
///
/// `Opened` is the only state admitting new transfers. `Withdrawing` and
/// `CooperativeSettling` are entered at either party's request and can be
/// cancelled back to `Opened` until the counter-party signs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Open for transfers.
    Opened,
    /// A withdraw is being negotiated; new locks are frozen.
    Withdrawing,
    /// A cooperative settle is being negotiated; new locks are frozen.
    CooperativeSettling,
    /// `close` confirmed on chain; settle window running.
    Closed,
    /// `settle` confirmed on chain; terminal.
    Settled,
    /// The settle window elapsed without settlement.
    SettleTimedOut,
}

impl ChannelStatus {
    /// Whether the lifecycle machine allows moving from `self` to `to`.
    pub fn can_transition(self, to: ChannelStatus) -> bool {
        use ChannelStatus::*;
        matches!(
            (self, to),
            (Opened, Withdrawing)
                | (Opened, CooperativeSettling)
                | (Opened, Closed)
                // Cancellation before the partner signs.
                | (Withdrawing, Opened)
                | (CooperativeSettling, Opened)
                // The partner can force-close mid-negotiation.
                | (Withdrawing, Closed)
                | (CooperativeSettling, Closed)
                // A signed cooperative settle lands directly as settled.
                | (CooperativeSettling, Settled)
                | (Closed, Settled)
                | (Closed, SettleTimedOut)
                | (SettleTimedOut, Settled)
        )
    }

    /// Whether new transfers and new locks are admissible.
    #[inline]
    pub fn accepts_transfers(self) -> bool {
        self == ChannelStatus::Opened
    }

    /// Whether the channel has reached its terminal state.
    #[inline]
    pub fn is_settled(self) -> bool {
        self == ChannelStatus::Settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelStatus::*;

    #[test]
    fn test_only_opened_accepts_transfers() {
        for status in [Opened, Withdrawing, CooperativeSettling, Closed, Settled, SettleTimedOut] {
            assert_eq!(status.accepts_transfers(), status == Opened);
        }
    }

    #[test]
    fn test_cancellation_paths() {
        assert!(Withdrawing.can_transition(Opened));
        assert!(CooperativeSettling.can_transition(Opened));
    }

    #[test]
    fn test_settled_is_terminal() {
        for status in [Opened, Withdrawing, CooperativeSettling, Closed, Settled, SettleTimedOut] {
            assert!(!Settled.can_transition(status));
        }
    }

    #[test]
    fn test_no_reopen_after_close() {
        assert!(!Closed.can_transition(Opened));
        assert!(!SettleTimedOut.can_transition(Opened));
    }

    #[test]
    fn test_close_always_possible_before_settlement() {
        assert!(Opened.can_transition(Closed));
        assert!(Withdrawing.can_transition(Closed));
        assert!(CooperativeSettling.can_transition(Closed));
    }
}
