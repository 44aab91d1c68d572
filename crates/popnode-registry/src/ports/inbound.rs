//! # Driving Ports (Inbound API)

use std::net::SocketAddr;

use crate::domain::{BlockHeight, DispatchOutcome, GossipMessage, Hash, NodeEntry, NodeIdentity};

/// Registry queries used by consensus collaborators (payments, voting,
/// mixing). All results are owned copies.
pub trait PopnodeRegistryApi: Send + Sync {
    fn enumerate_enabled(&self, min_protocol: Option<u32>) -> Vec<NodeEntry>;

    /// `(rank, entry)` pairs at `height`, rank 1 first. Empty if the block
    /// is unknown.
    fn rank_at(&self, height: BlockHeight, min_protocol: Option<u32>) -> Vec<(usize, NodeEntry)>;

    fn identity_at(&self, index: u32) -> Option<NodeIdentity>;

    fn index_of(&self, identity: &NodeIdentity) -> Option<u32>;

    /// `(added, removed)` since the last membership notification.
    fn change_flags(&self) -> (bool, bool);

    /// Chain tip notification.
    fn ledger_tip_changed(&self, height: BlockHeight, block_hash: Hash);
}

/// Entry point for popnode gossip from the session layer.
pub trait GossipHandler: Send + Sync {
    fn process_message(&self, peer: SocketAddr, message: GossipMessage) -> DispatchOutcome;
}
