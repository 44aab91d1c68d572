//! # Popnode Registry Service
//!
//! `PopnodeRegistry` owns the [`crate::domain::RegistryState`] behind one
//! `parking_lot::Mutex` and wires it to the outbound ports.
//!
//! Every public method takes the lock once. Internal `*_locked` helpers
//! receive the guard so a single inbound message is handled atomically.
//! Outbound effects are returned as [`crate::domain::OutboundAction`]s;
//! chain and collateral lookups are the only port calls made under the lock.

mod api;
mod core;
mod gossip;
mod maintenance;
mod persistence;
mod recovery;
mod verification;

pub use self::core::{LocalPopnode, PopnodeRegistry, RegistryDeps};
pub use gossip::execute_actions;
pub use persistence::LoadStatus;

#[cfg(test)]
mod tests;
