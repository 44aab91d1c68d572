use std::net::SocketAddr;

use crate::domain::{BlockHeight, DispatchOutcome, GossipMessage, Hash, NodeEntry, NodeIdentity};
use crate::ports::{GossipHandler, PopnodeRegistryApi};
use crate::service::PopnodeRegistry;

impl PopnodeRegistryApi for PopnodeRegistry {
    fn enumerate_enabled(&self, min_protocol: Option<u32>) -> Vec<NodeEntry> {
        self.enabled_entries(min_protocol)
    }

    fn rank_at(&self, height: BlockHeight, min_protocol: Option<u32>) -> Vec<(usize, NodeEntry)> {
        self.rank_all(height, min_protocol)
    }

    fn identity_at(&self, index: u32) -> Option<NodeIdentity> {
        PopnodeRegistry::identity_at(self, index)
    }

    fn index_of(&self, identity: &NodeIdentity) -> Option<u32> {
        PopnodeRegistry::index_of(self, identity)
    }

    fn change_flags(&self) -> (bool, bool) {
        let st = self.state.lock();
        (st.added, st.removed)
    }

    fn ledger_tip_changed(&self, height: BlockHeight, block_hash: Hash) {
        PopnodeRegistry::ledger_tip_changed(self, height, block_hash)
    }
}

impl GossipHandler for PopnodeRegistry {
    fn process_message(&self, peer: SocketAddr, message: GossipMessage) -> DispatchOutcome {
        PopnodeRegistry::process_message(self, peer, message)
    }
}
