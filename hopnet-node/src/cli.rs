//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Hopnet payment-channel node.
#[derive(Parser, Debug, Clone)]
#[command(name = "hopnet-node")]
#[command(about = "Off-chain payment-channel node")]
#[command(version)]
pub struct Cli {
    /// Data directory for the write-ahead log and channel state.
    #[arg(long, default_value = "~/.hopnet")]
    pub data_dir: PathBuf,

    /// Path to the node's 32-byte secret key file.
    #[arg(long)]
    pub keyfile: Option<PathBuf>,

    /// Blocks after close before on-chain settlement is admissible.
    #[arg(long, default_value_t = 500)]
    pub settle_timeout: u64,

    /// Minimum blocks between learning a secret and its deadline.
    #[arg(long, default_value_t = 30)]
    pub reveal_timeout: u64,

    /// Flat fee (token units) charged for mediating a transfer.
    #[arg(long, default_value_t = 0)]
    pub mediation_fee: u64,

    /// State changes between snapshots.
    #[arg(long, default_value_t = 1000)]
    pub snapshot_interval: u64,

    /// Run against an in-memory mock chain with no peers, for local
    /// experimentation.
    #[arg(long)]
    pub devnet: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Expand the data directory path (handle ~ for home).
    pub fn expanded_data_dir(&self) -> PathBuf {
        let path_str = self.data_dir.to_string_lossy();
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        self.data_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["hopnet-node"]);
        assert_eq!(cli.settle_timeout, 500);
        assert_eq!(cli.reveal_timeout, 30);
        assert_eq!(cli.log_level, "info");
        assert!(cli.keyfile.is_none());
    }

    #[test]
    fn test_timeout_overrides() {
        let cli = Cli::parse_from([
            "hopnet-node",
            "--settle-timeout",
            "100",
            "--reveal-timeout",
            "10",
        ]);
        assert_eq!(cli.settle_timeout, 100);
        assert_eq!(cli.reveal_timeout, 10);
    }
}
