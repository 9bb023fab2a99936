//! # Hopnet Chain
//!
//! The node's view of the anchoring chain. The Ethereum RPC client and
//! the contracts themselves live outside this workspace; this crate
//! defines the traits they implement, the projection of raw contract
//! log records into protocol state changes, the persistable status
//! records for submitted transactions, and an in-memory mock used by
//! scenario tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod mock;
pub mod proxy;
pub mod txinfo;

pub use error::{ChainError, ChainResult};
pub use events::{ContractLogRecord, EventProjector};
pub use mock::MockChain;
pub use proxy::{EscrowContract, SecretRegistry};
pub use txinfo::{ContractCallRecord, TxStatus};
