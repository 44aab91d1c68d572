//! Recovery of entries stuck in new-start-required.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::domain::{
    Announcement, Hash, NodeEntry, NodeIdentity, OutboundAction, RecoveryRequest, RegistryState,
    Timestamp,
};
use crate::service::PopnodeRegistry;

impl PopnodeRegistry {
    /// Open recovery requests for new-start-required entries that have
    /// none, at most `recovery_max_ask_entries` per call.
    pub(crate) fn schedule_recoveries_locked(&self, st: &mut RegistryState, now: Timestamp) {
        let Some(tip) = st.tip_height() else {
            return;
        };
        if !self.chain.is_list_synced() {
            return;
        }

        let stuck: Vec<(NodeIdentity, Hash)> = st
            .entries()
            .iter()
            .filter(|e| e.is_new_start_required())
            .map(|e| (e.identity, Announcement::from_entry(e).hash()))
            .filter(|(_, hash)| !st.recovery.is_requested(hash))
            .collect();
        if stuck.is_empty() {
            return;
        }

        // One ranking at a random height below the tip serves every request
        // of this sweep.
        let height = self.rng.gen_range(tip);
        let ranks = self.ranks_locked(st, height, None, now);

        let mut budget = self.config.recovery_max_ask_entries;
        for (identity, hash) in stuck {
            if budget == 0 {
                break;
            }
            let mut asked = BTreeSet::new();
            let mut targets: Vec<SocketAddr> = Vec::new();
            for (_, peer) in &ranks {
                if asked.len() >= self.config.recovery_quorum_total {
                    break;
                }
                if peer.identity == identity {
                    continue;
                }
                let ip = peer.addr.ip();
                if st.throttle.asked_entry_recently(&identity, &ip, now) {
                    continue;
                }
                if asked.insert(ip) {
                    targets.push(peer.addr);
                }
            }
            if asked.is_empty() {
                debug!("[popnode] no peer to ask for recovery of {}", identity);
                continue;
            }
            budget -= 1;
            info!(
                "[popnode] recovery of {} requested from {} peers (ranked at height {})",
                identity,
                asked.len(),
                height
            );
            st.recovery.open(hash, now, asked, targets);
        }
    }

    /// Record a re-announcement from a peer we asked, and apply the quorum
    /// result once enough replies agree.
    pub(crate) fn collect_recovery_reply(
        &self,
        st: &mut RegistryState,
        hash: Hash,
        peer: SocketAddr,
        announcement: &Announcement,
        now: Timestamp,
        actions: &mut Vec<OutboundAction>,
    ) {
        if !st
            .recovery
            .take_asked_peer(&hash, &peer.ip(), now, self.config.recovery_wait_secs)
        {
            return;
        }

        let known_ping = st
            .seen
            .announcement(&hash)
            .map(|mnb| mnb.last_ping_time())
            .unwrap_or(0);
        if announcement.last_ping_time() <= known_ping {
            debug!(
                "[popnode] recovery reply for {} from {} has no newer ping",
                announcement.identity, peer
            );
            return;
        }

        // Simulate the entry with the offered ping.
        let mut simulated = NodeEntry::from_announcement(announcement);
        let ctx = self.check_context(st, now);
        self.check_entry_at(&mut simulated, &ctx, true);
        if !simulated.state.is_valid_for_auto_start() {
            debug!(
                "[popnode] recovery reply for {} from {} simulates to {}",
                announcement.identity, peer, simulated.state
            );
            return;
        }

        let count = st
            .recovery
            .record_reply(hash, peer.ip(), announcement.clone());
        debug!(
            "[popnode] recovery reply {} for {} from {}",
            count, announcement.identity, peer
        );
        if count >= self.config.recovery_quorum_required {
            actions.extend(self.resolve_recovery_locked(st, hash, now));
        }
    }

    /// Apply the majority reply through the normal acceptance path.
    fn resolve_recovery_locked(
        &self,
        st: &mut RegistryState,
        hash: Hash,
        now: Timestamp,
    ) -> Vec<OutboundAction> {
        let Some(mut winner) = st
            .recovery
            .quorum_candidate(&hash, self.config.recovery_quorum_required)
        else {
            return Vec::new();
        };
        st.recovery.resolve(&hash);
        winner.recovery = true;
        let identity = winner.identity;

        match self.check_and_update_announcement_locked(st, None, winner, now) {
            Ok(actions) => {
                info!("[popnode] {} recovered by quorum", identity);
                actions
            }
            Err(rejection) => {
                warn!(
                    "[popnode] recovery quorum for {} not applied: {}",
                    identity, rejection
                );
                Vec::new()
            }
        }
    }

    /// Resolve or abandon requests whose reply window closed, then forget
    /// requests past the retry delay.
    pub(crate) fn process_recovery_windows_locked(
        &self,
        st: &mut RegistryState,
        now: Timestamp,
    ) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        for hash in st.recovery.window_closed(now, self.config.recovery_wait_secs) {
            if st
                .recovery
                .quorum_candidate(&hash, self.config.recovery_quorum_required)
                .is_some()
            {
                actions.extend(self.resolve_recovery_locked(st, hash, now));
            } else {
                let replies = st.recovery.replies(&hash).len();
                st.recovery.abandon(&hash);
                info!(
                    "[popnode] recovery {} abandoned with {} replies",
                    hex::encode(&hash[..6]),
                    replies
                );
            }
        }
        let pruned = st.recovery.prune(now, self.config.recovery_retry_secs);
        if pruned > 0 {
            debug!("[popnode] {} recovery records expired", pruned);
        }
        actions
    }

    /// Next address to connect to for recovery, with every announcement
    /// hash to request from it.
    pub fn pop_scheduled_connection(&self) -> Option<(SocketAddr, BTreeSet<Hash>)> {
        self.state.lock().recovery.pop_scheduled()
    }

    pub fn is_recovery_requested(&self, hash: &Hash) -> bool {
        self.state.lock().recovery.is_requested(hash)
    }

    pub fn recovery_request(&self, hash: &Hash) -> Option<RecoveryRequest> {
        self.state.lock().recovery.request(hash).cloned()
    }

    pub fn recovery_reply_count(&self, hash: &Hash) -> usize {
        self.state.lock().recovery.replies(hash).len()
    }
}
