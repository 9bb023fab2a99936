//! On-chain facade of a channel.

use serde::{Deserialize, Serialize};

use hopnet_core::{BlockNumber, ChannelId};

/// What the escrow contract knows about a channel.
///
/// Kept separate from the off-chain endpoint states because it only ever
/// changes through confirmed on-chain events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalState {
    /// Identifier assigned by the escrow contract.
    pub channel_id: ChannelId,
    /// Block at which the channel was opened.
    pub open_block: BlockNumber,
    /// Block at which `close` was confirmed, if any.
    pub closed_block: Option<BlockNumber>,
    /// Block at which `settle` was confirmed, if any.
    pub settled_block: Option<BlockNumber>,
    /// Blocks after close before settlement is admissible.
    pub settle_timeout: BlockNumber,
    /// Minimum blocks a hop needs between learning a secret and the
    /// on-chain deadline.
    pub reveal_timeout: BlockNumber,
}

impl ExternalState {
    /// Create the facade for a freshly opened channel.
    pub fn new(
        channel_id: ChannelId,
        open_block: BlockNumber,
        settle_timeout: BlockNumber,
        reveal_timeout: BlockNumber,
    ) -> Self {
        ExternalState {
            channel_id,
            open_block,
            closed_block: None,
            settled_block: None,
            settle_timeout,
            reveal_timeout,
        }
    }

    /// First block at which `settle` may be called, once closed.
    pub fn settle_ready_block(&self) -> Option<BlockNumber> {
        self.closed_block.map(|closed| closed + self.settle_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_ready_block() {
        let mut ext = ExternalState::new([9u8; 32], 10, 500, 30);
        assert_eq!(ext.settle_ready_block(), None);
        ext.closed_block = Some(100);
        assert_eq!(ext.settle_ready_block(), Some(600));
    }
}
