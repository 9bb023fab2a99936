//! Projection of contract log records into state changes.

use serde::{Deserialize, Serialize};

use hopnet_core::{Address, BlockNumber, ChannelId, Secret, TokenAddress, TokenAmount};
use hopnet_state::StateChange;

use crate::error::{ChainError, ChainResult};

/// A decoded contract log record, as delivered by the RPC poller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractLogRecord {
    /// `ChannelOpened(channel_id, token, participant1, participant2,
    /// settle_timeout)`.
    ChannelOpened {
        /// New channel id.
        channel_id: ChannelId,
        /// Token network.
        token_address: TokenAddress,
        /// One participant.
        participant1: Address,
        /// The other participant.
        participant2: Address,
        /// Channel settle timeout.
        settle_timeout: BlockNumber,
        /// Block of the record.
        block_number: BlockNumber,
    },
    /// `ChannelNewDeposit(channel_id, participant, total_deposit)`.
    Deposit {
        /// Channel deposited into.
        channel_id: ChannelId,
        /// Depositor.
        participant: Address,
        /// Depositor's new total.
        total_deposit: TokenAmount,
        /// Block of the record.
        block_number: BlockNumber,
    },
    /// `ChannelClosed(channel_id, closing_participant)`.
    Closed {
        /// Closed channel.
        channel_id: ChannelId,
        /// Who closed it.
        closing_participant: Address,
        /// Block of the record.
        block_number: BlockNumber,
    },
    /// `ChannelSettled(channel_id)`.
    Settled {
        /// Settled channel.
        channel_id: ChannelId,
        /// Block of the record.
        block_number: BlockNumber,
    },
    /// `ChannelWithdraw(channel_id, participant, total_withdraw)`.
    Withdraw {
        /// Channel withdrawn from.
        channel_id: ChannelId,
        /// Withdrawing participant.
        participant: Address,
        /// Participant's new withdrawn total.
        total_withdrawn: TokenAmount,
        /// Block of the record.
        block_number: BlockNumber,
    },
    /// `SecretRevealed(secret_hash, secret)` from the secret registry.
    SecretRevealed {
        /// The published preimage.
        secret: Secret,
        /// Block of the record.
        block_number: BlockNumber,
    },
}

/// Translates log records into the state changes the core consumes.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventProjector;

impl EventProjector {
    /// Project one record. Fails only on records that violate their own
    /// declared shape (the RPC layer already decoded the ABI).
    pub fn project(&self, record: ContractLogRecord) -> ChainResult<StateChange> {
        match record {
            ContractLogRecord::ChannelOpened {
                channel_id,
                token_address,
                participant1,
                participant2,
                settle_timeout,
                block_number,
            } => {
                if participant1 == participant2 {
                    return Err(ChainError::BadLogRecord(
                        "channel with identical participants".into(),
                    ));
                }
                Ok(StateChange::ContractChannelOpened {
                    channel_id,
                    token_address,
                    participant1,
                    participant2,
                    settle_timeout,
                    block_number,
                })
            }
            ContractLogRecord::Deposit {
                channel_id,
                participant,
                total_deposit,
                block_number,
            } => Ok(StateChange::ContractDeposit {
                channel_id,
                participant,
                total_deposit,
                block_number,
            }),
            ContractLogRecord::Closed { channel_id, closing_participant, block_number } => {
                Ok(StateChange::ContractChannelClosed {
                    channel_id,
                    closing_participant,
                    block_number,
                })
            }
            ContractLogRecord::Settled { channel_id, block_number } => {
                Ok(StateChange::ContractChannelSettled { channel_id, block_number })
            }
            ContractLogRecord::Withdraw {
                channel_id,
                participant,
                total_withdrawn,
                block_number,
            } => Ok(StateChange::ContractWithdraw {
                channel_id,
                participant,
                total_withdrawn,
                block_number,
            }),
            ContractLogRecord::SecretRevealed { secret, block_number } => {
                Ok(StateChange::RegistrySecretRevealed {
                    secret,
                    secret_hash: hopnet_core::keccak256(&secret),
                    block_number,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_reveal_projects_with_hash() {
        let secret = [9u8; 32];
        let change = EventProjector
            .project(ContractLogRecord::SecretRevealed { secret, block_number: 7 })
            .unwrap();
        match change {
            StateChange::RegistrySecretRevealed { secret_hash, block_number, .. } => {
                assert_eq!(secret_hash, hopnet_core::keccak256(&secret));
                assert_eq!(block_number, 7);
            }
            other => panic!("unexpected projection {:?}", other),
        }
    }

    #[test]
    fn test_self_channel_rejected() {
        let record = ContractLogRecord::ChannelOpened {
            channel_id: [1u8; 32],
            token_address: [2u8; 20],
            participant1: [3u8; 20],
            participant2: [3u8; 20],
            settle_timeout: 500,
            block_number: 1,
        };
        assert!(matches!(
            EventProjector.project(record),
            Err(ChainError::BadLogRecord(_))
        ));
    }

    #[test]
    fn test_close_projects() {
        let change = EventProjector
            .project(ContractLogRecord::Closed {
                channel_id: [1u8; 32],
                closing_participant: [3u8; 20],
                block_number: 42,
            })
            .unwrap();
        assert!(matches!(
            change,
            StateChange::ContractChannelClosed { block_number: 42, .. }
        ));
    }
}
