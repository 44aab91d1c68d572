//! # Popnode Registry
//!
//! Registry of the cooperating service nodes ("popnodes") of a Popchain
//! network: it keeps the list of known nodes, gives each a stable integer
//! index, ranks them deterministically per block, and runs the gossip and
//! quorum protocol that lets peers announce, verify, expire and recover
//! each other's registration.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** Entries, liveness rules, identity index, ranking,
//!   verification and recovery bookkeeping. Pure, no I/O.
//! - **Ports Layer:** Chain view, collateral ledger, signatures, clock,
//!   randomness, peer network, snapshot storage.
//! - **Service Layer:** `PopnodeRegistry`, one lock around the aggregate;
//!   every outbound effect is returned as an `OutboundAction`.
//! - **Adapters Layer:** k256 signatures, system clock, `rand` entropy,
//!   TOML config, cache file, tokio drain tasks.
//!
//! ## Example
//!
//! ```rust,ignore
//! use popnode_registry::{GossipMessage, PopnodeRegistry, RegistryConfig, RegistryDeps};
//!
//! let registry = PopnodeRegistry::new(RegistryConfig::default(), deps);
//! let outcome = registry.process_message(peer, GossipMessage::ListRequest(None));
//! for action in outcome.actions {
//!     // hand to the session layer
//! }
//! ```

pub mod adapters;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use domain::*;
pub use error::{ConfigError, PersistenceError, RegistryError, RegistryResult, SignerError};
pub use ports::inbound::{GossipHandler, PopnodeRegistryApi};
pub use ports::outbound::{
    ChainView, CollateralLedger, CollateralVerdict, ConfigProvider, MembershipListener,
    MessageSigner, PeerConnector, PeerNetwork, RandomSource, SignatureVerifier, SnapshotStore,
    TimeSource,
};
pub use service::{LoadStatus, LocalPopnode, PopnodeRegistry, RegistryDeps};
