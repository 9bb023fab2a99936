//! Node configuration.

use std::path::PathBuf;

use hopnet_core::{BlockNumber, TokenAmount};
use hopnet_proto::RetrySchedule;

use crate::cli::Cli;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for the write-ahead log and channel state.
    pub data_dir: PathBuf,

    /// Default settle timeout for channels we open.
    pub settle_timeout: BlockNumber,

    /// Reveal timeout applied to every channel.
    pub reveal_timeout: BlockNumber,

    /// Flat fee charged when mediating a transfer.
    pub mediation_fee: TokenAmount,

    /// State changes between snapshots.
    pub snapshot_interval: u64,

    /// Redelivery schedule for unacknowledged messages.
    pub retry: RetrySchedule,

    /// Seconds between health-check pings per neighbour.
    pub ping_interval: u64,

    /// Log level.
    pub log_level: String,
}

impl NodeConfig {
    /// Build a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            data_dir: cli.expanded_data_dir(),
            settle_timeout: cli.settle_timeout,
            reveal_timeout: cli.reveal_timeout,
            mediation_fee: TokenAmount::from_u64(cli.mediation_fee),
            snapshot_interval: cli.snapshot_interval,
            retry: RetrySchedule::default(),
            ping_interval: hopnet_proto::health::DEFAULT_PING_INTERVAL,
            log_level: cli.log_level.clone(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.hopnet"),
            settle_timeout: 500,
            reveal_timeout: 30,
            mediation_fee: TokenAmount::zero(),
            snapshot_interval: 1000,
            retry: RetrySchedule::default(),
            ping_interval: hopnet_proto::health::DEFAULT_PING_INTERVAL,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.settle_timeout, 500);
        assert_eq!(config.reveal_timeout, 30);
        assert!(config.settle_timeout > config.reveal_timeout);
    }

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from(["hopnet-node", "--mediation-fee", "2"]);
        let config = NodeConfig::from_cli(&cli);
        assert_eq!(config.mediation_fee, TokenAmount::from_u64(2));
    }
}
