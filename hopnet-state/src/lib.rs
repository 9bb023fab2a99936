//! # Hopnet State
//!
//! The deterministic core of a hopnet node: channel state, the three
//! mediated-transfer state machines (initiator, mediator, target) and
//! per-token routing.
//!
//! Everything in this crate is pure data plus pure functions. All
//! non-determinism (fresh secrets, current block, route order) arrives
//! inside [`transfer::StateChange`] payloads, so a node replaying its
//! write-ahead log reaches byte-identical state.

#![deny(unsafe_code)]

pub mod channel;
pub mod error;
pub mod merkle;
pub mod routing;
pub mod transfer;

pub use channel::{Channel, ChannelEnd, ChannelStatus, ExternalState};
pub use error::{ChannelError, ChannelResult};
pub use merkle::LockTree;
pub use routing::{ChannelGraph, Route, RoutesState};
pub use transfer::{Event, StateChange, StateManager, TransferRole, TransferState};
