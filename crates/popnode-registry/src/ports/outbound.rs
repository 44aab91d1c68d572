//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the host application implements. Everything the registry
//! does not own (chain state, collateral rules, the signature scheme,
//! the wire) is reached through these traits.

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::domain::{
    Announcement, BlockHeight, GossipMessage, Hash, Inventory, NodeIdentity, PayeeScript,
    PublicKey, RegistryConfig, Signature, Timestamp,
};
use crate::error::{PersistenceError, SignerError};

/// Network-adjusted clock.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Uniform randomness for peer selection and challenge nonces.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `0..upper`; 0 when `upper` is 0.
    fn gen_range(&self, upper: u64) -> u64;
}

/// Read access to the active chain.
///
/// Called with the registry lock held. Implementations answer from an
/// in-memory view of the chain and must not block on I/O.
pub trait ChainView: Send + Sync {
    fn block_hash(&self, height: BlockHeight) -> Option<Hash>;

    /// Height of a block on the active chain.
    fn block_height(&self, hash: &Hash) -> Option<BlockHeight>;

    fn block_time(&self, height: BlockHeight) -> Option<Timestamp>;

    /// Payee the block at `height` paid as its popnode duty, if any.
    fn duty_payee(&self, height: BlockHeight) -> Option<PayeeScript>;

    /// The block chain finished its initial download. Gossip is ignored
    /// until then.
    fn is_blockchain_synced(&self) -> bool;

    /// The popnode list finished its initial sync.
    fn is_list_synced(&self) -> bool;
}

/// Verdict of the collateral rules on an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollateralVerdict {
    Valid,
    /// Collateral exists but lacks confirmations; try again later.
    NotYetConfirmed,
    Invalid { misbehavior: u32 },
}

/// Collateral transaction rules, owned by the ledger.
///
/// Called with the registry lock held, like [`ChainView`]. Answers come
/// from the ledger's in-memory UTXO view without blocking.
pub trait CollateralLedger: Send + Sync {
    fn verify_collateral(&self, announcement: &Announcement) -> CollateralVerdict;

    fn is_spent(&self, identity: &NodeIdentity) -> bool;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> bool;
}

/// Signing capability of the local popnode's node key.
pub trait MessageSigner: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, message: &[u8]) -> Result<Signature, SignerError>;
}

/// Session layer sink for [`crate::domain::OutboundAction`]s.
pub trait PeerNetwork: Send + Sync {
    fn send(&self, peer: SocketAddr, message: GossipMessage);

    fn push_inventory(&self, peer: SocketAddr, inventory: Inventory);

    fn request_data(&self, peer: SocketAddr, inventory: Vec<Inventory>);

    fn relay(&self, inventory: Inventory);

    fn send_sync_count(&self, peer: SocketAddr, count: usize);

    fn penalize(&self, peer: SocketAddr, score: u32);
}

/// Notified after membership changes, outside the registry lock.
pub trait MembershipListener: Send + Sync {
    fn on_membership_changed(&self, added: bool, removed: bool);
}

/// Durable storage for the registry cache.
pub trait SnapshotStore: Send + Sync {
    fn write(&self, payload: &[u8]) -> Result<(), PersistenceError>;

    /// `Ok(None)` if nothing has been stored yet.
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// Source of the registry configuration.
pub trait ConfigProvider: Send + Sync {
    fn registry_config(&self) -> RegistryConfig;
}

/// Opens a connection and asks for announcements by hash.
///
/// Used to drain recovery connections outside the registry lock.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn request_announcements(
        &self,
        addr: SocketAddr,
        hashes: Vec<Hash>,
    ) -> Result<(), ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection to {0} failed")]
    Unreachable(SocketAddr),
    #[error("connection timed out")]
    Timeout,
}
