//! # Hopnet Node
//!
//! The node binary's library: the single-threaded event loop that owns
//! all mutable protocol state, the user request API, token swaps,
//! configuration and graceful shutdown.

#![deny(unsafe_code)]

pub mod api;
pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
pub mod swap;

pub use api::{ApiError, ApiRequest, NodeApi, PaymentOutcome};
pub use config::NodeConfig;
pub use node::{NodeHandles, NodeService};
pub use swap::{SwapRole, TokenSwap};
