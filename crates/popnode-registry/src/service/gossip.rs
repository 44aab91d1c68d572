//! Gossip dispatcher: list requests, announcements and pings.

use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::domain::{
    is_local_addr, Announcement, DispatchOutcome, GossipMessage, Hash, Inventory, InventoryKind,
    NodeEntry, NodeIdentity, OutboundAction, Ping, PopnodeState, RegistryState, RejectReason,
    Rejection, Timestamp,
};
use crate::ports::{CollateralVerdict, PeerNetwork};
use crate::service::PopnodeRegistry;

fn short(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

/// Hand a batch of actions to the session layer.
pub fn execute_actions(network: &dyn PeerNetwork, actions: Vec<OutboundAction>) {
    for action in actions {
        match action {
            OutboundAction::Send { peer, message } => network.send(peer, message),
            OutboundAction::PushInventory { peer, inventory } => {
                network.push_inventory(peer, inventory)
            }
            OutboundAction::RequestData { peer, inventory } => {
                network.request_data(peer, inventory)
            }
            OutboundAction::Relay(inventory) => network.relay(inventory),
            OutboundAction::SyncCount { peer, count } => network.send_sync_count(peer, count),
        }
    }
}

impl PopnodeRegistry {
    /// Dispatch one inbound gossip message.
    pub fn process_message(&self, peer: SocketAddr, message: GossipMessage) -> DispatchOutcome {
        if !self.chain.is_blockchain_synced() {
            debug!(
                "[popnode] chain not synced, dropping {} from {}",
                message.kind(),
                peer
            );
            return DispatchOutcome::ignored();
        }

        let now = self.now();
        let mut state = self.state.lock();
        let st = &mut *state;
        match message {
            GossipMessage::ListRequest(identity) => {
                self.handle_list_request(st, peer, identity, now)
            }
            GossipMessage::Announce(announcement) => {
                self.handle_announcement(st, peer, announcement, now)
            }
            GossipMessage::Ping(ping) => self.handle_ping(st, peer, ping, now),
            GossipMessage::VerifyRequest(verification) => {
                self.send_verify_reply_locked(st, peer, verification, now)
            }
            GossipMessage::VerifyReply(verification) => {
                self.process_verify_reply_locked(st, peer, verification, now)
            }
            GossipMessage::VerifyBroadcast(verification) => {
                self.process_verify_broadcast_locked(st, peer, verification, now)
            }
        }
    }

    /// Dispatch a message and execute the outcome, including the
    /// misbehavior penalty, after the lock is released.
    pub fn handle_message(
        &self,
        network: &dyn PeerNetwork,
        peer: SocketAddr,
        message: GossipMessage,
    ) -> DispatchOutcome {
        let outcome = self.process_message(peer, message);
        if outcome.misbehavior() > 0 {
            network.penalize(peer, outcome.misbehavior());
        }
        execute_actions(network, outcome.actions.clone());
        outcome
    }

    fn handle_list_request(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        identity: Option<NodeIdentity>,
        now: Timestamp,
    ) -> DispatchOutcome {
        let ip = peer.ip();
        if identity.is_none()
            && !is_local_addr(&ip)
            && !st
                .throttle
                .admit_list_request(ip, now, self.config.list_request_interval_secs)
        {
            debug!("[popnode] full list request from {} throttled", peer);
            return DispatchOutcome::ignored();
        }

        let mut actions = Vec::new();
        let mut served: Vec<Announcement> = Vec::new();
        for entry in st.entries() {
            if identity.is_some_and(|id| id != entry.identity) {
                continue;
            }
            if is_local_addr(&entry.addr.ip()) || entry.is_update_required() {
                continue;
            }
            let announcement = Announcement::from_entry(entry);
            actions.push(OutboundAction::PushInventory {
                peer,
                inventory: Inventory::announcement(announcement.hash()),
            });
            if let Some(ping) = &entry.last_ping {
                actions.push(OutboundAction::PushInventory {
                    peer,
                    inventory: Inventory::ping(ping.hash()),
                });
            }
            served.push(announcement);
        }

        let count = served.len();
        for announcement in served {
            if let Some(ping) = &announcement.last_ping {
                st.seen.record_ping(ping);
            }
            st.seen
                .record_announcement(announcement.hash(), now, announcement);
        }

        match identity {
            None => {
                actions.push(OutboundAction::SyncCount { peer, count });
                info!("[popnode] sent {} entries to {}", count, peer);
            }
            Some(id) if count > 0 => debug!("[popnode] sent entry {} to {}", id, peer),
            Some(_) => {}
        }
        DispatchOutcome::accepted(actions)
    }

    fn handle_announcement(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        announcement: Announcement,
        now: Timestamp,
    ) -> DispatchOutcome {
        let identity = announcement.identity;
        match self.check_and_update_announcement_locked(st, Some(peer), announcement, now) {
            Ok(actions) => DispatchOutcome::accepted(actions),
            Err(rejection) => {
                if rejection.misbehavior > 0 {
                    warn!(
                        "[popnode] announcement {} from {} rejected: {}",
                        identity, peer, rejection
                    );
                } else {
                    debug!(
                        "[popnode] announcement {} from {} not applied: {}",
                        identity, peer, rejection.reason
                    );
                }
                DispatchOutcome::rejected(rejection)
            }
        }
    }

    /// Full acceptance path for an announcement, also used to apply a
    /// recovery quorum result (`peer == None`, `recovery == true`).
    pub fn check_and_update_announcement(
        &self,
        peer: Option<SocketAddr>,
        announcement: Announcement,
    ) -> Result<Vec<OutboundAction>, Rejection> {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_and_update_announcement_locked(&mut st, peer, announcement, now)
    }

    pub(crate) fn check_and_update_announcement_locked(
        &self,
        st: &mut RegistryState,
        peer: Option<SocketAddr>,
        announcement: Announcement,
        now: Timestamp,
    ) -> Result<Vec<OutboundAction>, Rejection> {
        let hash = announcement.hash();
        let mut actions = Vec::new();

        if !announcement.recovery {
            if let Some(first_seen) = st.seen.first_seen(&hash) {
                let refresh_after = self.config.new_start_required_secs
                    - 2 * self.config.min_ping_interval_secs;
                if now - first_seen > refresh_after {
                    st.seen.touch_announcement(&hash, now);
                }
                if let Some(peer) = peer {
                    self.collect_recovery_reply(st, hash, peer, &announcement, now, &mut actions);
                }
                return Ok(actions);
            }
        }
        // Stays seen only if accepted: the hash does not cover the signature.
        let was_seen = st.seen.first_seen(&hash).is_some();
        st.seen
            .record_announcement(hash, now, announcement.clone());
        let result = self.apply_announcement_locked(st, hash, announcement, now, actions);
        if result.is_err() && !was_seen {
            st.seen.remove_announcement(&hash);
        }
        result
    }

    fn apply_announcement_locked(
        &self,
        st: &mut RegistryState,
        hash: Hash,
        announcement: Announcement,
        now: Timestamp,
        mut actions: Vec<OutboundAction>,
    ) -> Result<Vec<OutboundAction>, Rejection> {
        let initial_state = self.simple_check_announcement(&announcement, now)?;

        if let Some(pos) = st.position(&announcement.identity) {
            let old_hash = Announcement::from_entry(&st.entries()[pos]).hash();
            self.update_from_announcement_locked(st, pos, &announcement, now, &mut actions)?;
            if old_hash != hash {
                st.seen.remove_announcement(&old_hash);
            }
            return Ok(actions);
        }

        if !self.verify_signature(
            &announcement.collateral_key,
            &announcement.signing_message(),
            &announcement.signature,
        ) {
            return Err(Rejection::new(RejectReason::InvalidSignature, 100));
        }

        match self.collateral.verify_collateral(&announcement) {
            CollateralVerdict::Valid => {}
            CollateralVerdict::NotYetConfirmed => {
                return Err(Rejection::silent(RejectReason::CollateralNotConfirmed));
            }
            CollateralVerdict::Invalid { misbehavior } => {
                return Err(Rejection::new(RejectReason::CollateralRejected, misbehavior));
            }
        }

        let mut entry = NodeEntry::from_announcement(&announcement);
        entry.state = initial_state;
        if let Some(ping) = &announcement.last_ping {
            st.seen.record_ping(ping);
        }
        if st.add(entry) {
            info!(
                "[popnode] added {} at {}, {} entries",
                announcement.identity,
                announcement.addr,
                st.len()
            );
        }
        actions.push(OutboundAction::Relay(Inventory::announcement(hash)));
        Ok(actions)
    }

    /// Checks that need no registry state. Returns the state a new entry
    /// starts in.
    fn simple_check_announcement(
        &self,
        announcement: &Announcement,
        now: Timestamp,
    ) -> Result<PopnodeState, Rejection> {
        announcement.check_shape(now, &self.config)?;

        if announcement.protocol_version < self.config.min_payments_protocol {
            return Ok(PopnodeState::UpdateRequired);
        }
        let ping_ok = announcement.last_ping.as_ref().is_some_and(|ping| {
            ping.identity == announcement.identity
                && ping.sig_time <= now + self.config.max_signature_drift_secs
                && self.chain.block_height(&ping.block_hash).is_some()
        });
        if !ping_ok {
            return Ok(PopnodeState::Expired);
        }
        Ok(PopnodeState::PreEnabled)
    }

    fn update_from_announcement_locked(
        &self,
        st: &mut RegistryState,
        pos: usize,
        announcement: &Announcement,
        now: Timestamp,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), Rejection> {
        let ctx = self.check_context(st, now);
        {
            let entry = &mut st.entries_mut()[pos];
            if entry.sig_time == announcement.sig_time && !announcement.recovery {
                return Err(Rejection::silent(RejectReason::DuplicateSignatureTime));
            }
            if entry.sig_time > announcement.sig_time {
                warn!(
                    "[popnode] stale announcement for {}: {} < {}",
                    entry.identity, announcement.sig_time, entry.sig_time
                );
                return Err(Rejection::silent(RejectReason::StaleAnnouncement));
            }

            self.check_entry_at(entry, &ctx, false);
            if entry.is_pose_banned() {
                return Err(Rejection::silent(RejectReason::PoseBanned));
            }
            if entry.collateral_key != announcement.collateral_key {
                return Err(Rejection::new(RejectReason::CollateralKeyMismatch, 33));
            }
            if !self.verify_signature(
                &announcement.collateral_key,
                &announcement.signing_message(),
                &announcement.signature,
            ) {
                return Err(Rejection::new(RejectReason::InvalidSignature, 100));
            }
            if entry.is_broadcasted_within(self.config.min_announce_interval_secs, now)
                && !self.is_local(&entry.identity)
            {
                debug!(
                    "[popnode] {} re-announced too soon, keeping current data",
                    entry.identity
                );
                return Ok(());
            }
        }

        if self.apply_new_broadcast(st, pos, announcement, now) {
            let ctx = self.check_context(st, now);
            let entry = &mut st.entries_mut()[pos];
            self.check_entry_at(entry, &ctx, true);
            info!(
                "[popnode] {} updated from a new announcement, state {}",
                entry.identity, entry.state
            );
            actions.push(OutboundAction::Relay(Inventory::announcement(
                announcement.hash(),
            )));
        }
        Ok(())
    }

    /// Replace the entry's registration data with a newer announcement.
    fn apply_new_broadcast(
        &self,
        st: &mut RegistryState,
        pos: usize,
        announcement: &Announcement,
        now: Timestamp,
    ) -> bool {
        let tip = st.tip_height();
        let entry = &st.entries()[pos];
        if announcement.sig_time <= entry.sig_time && !announcement.recovery {
            return false;
        }

        let ping_ok = match &announcement.last_ping {
            None => true,
            Some(ping) => match self.validate_ping(entry, ping, true, now, tip) {
                Ok(()) => true,
                Err(rejection) => {
                    debug!(
                        "[popnode] ping in announcement for {} not used: {}",
                        entry.identity, rejection.reason
                    );
                    false
                }
            },
        };

        let entry = &mut st.entries_mut()[pos];
        entry.apply_announcement(announcement);
        if ping_ok {
            entry.last_ping = announcement.last_ping.clone();
            if let Some(ping) = &announcement.last_ping {
                st.seen.record_ping(ping);
                st.seen.refresh_announcement_ping(&announcement.hash(), ping);
            }
        }
        true
    }

    /// Every ping rule except dedup. `from_new_broadcast` relaxes the state
    /// checks for pings embedded in a re-announcement.
    pub(crate) fn validate_ping(
        &self,
        entry: &NodeEntry,
        ping: &Ping,
        from_new_broadcast: bool,
        now: Timestamp,
        tip: Option<u64>,
    ) -> Result<(), Rejection> {
        if ping.identity != entry.identity {
            return Err(Rejection::silent(RejectReason::UnknownEntry));
        }
        if ping.sig_time > now + self.config.max_signature_drift_secs {
            return Err(Rejection::new(RejectReason::FutureSignatureTime, 1));
        }
        if ping.sig_time <= now - self.config.max_signature_drift_secs {
            return Err(Rejection::silent(RejectReason::ExpiredSignatureTime));
        }
        let Some(block_height) = self.chain.block_height(&ping.block_hash) else {
            return Err(Rejection::silent(RejectReason::UnknownBlock));
        };
        if !from_new_broadcast {
            if entry.is_update_required() {
                return Err(Rejection::silent(RejectReason::UpdateRequired));
            }
            if entry.is_new_start_required() {
                return Err(Rejection::silent(RejectReason::NewStartRequired));
            }
        }
        if let Some(tip) = tip {
            if block_height + self.config.max_ping_block_depth < tip {
                return Err(Rejection::silent(RejectReason::PingBlockTooOld));
            }
        }
        if entry.is_pinged_within(self.config.min_ping_interval_secs - 60, ping.sig_time) {
            return Err(Rejection::silent(RejectReason::PingTooEarly));
        }
        if !self.verify_signature(&entry.node_key, &ping.signing_message(), &ping.signature) {
            return Err(Rejection::new(RejectReason::InvalidSignature, 33));
        }
        Ok(())
    }

    fn handle_ping(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        ping: Ping,
        now: Timestamp,
    ) -> DispatchOutcome {
        let hash = ping.hash();
        if st.seen.has_ping(&hash) {
            return DispatchOutcome::ignored();
        }

        let Some(pos) = st.position(&ping.identity) else {
            if ping.sig_time > now + self.config.max_signature_drift_secs {
                return DispatchOutcome::rejected(Rejection::new(
                    RejectReason::FutureSignatureTime,
                    1,
                ));
            }
            debug!(
                "[popnode] ping {} for unknown entry {}",
                short(&hash),
                ping.identity
            );
            let actions = self
                .ask_for_entry_locked(st, peer, ping.identity, now)
                .into_iter()
                .collect();
            return DispatchOutcome::accepted(actions);
        };

        if st.entries()[pos].is_new_start_required() {
            return DispatchOutcome::ignored();
        }

        match self.check_and_update_ping_locked(st, pos, &ping, now) {
            Ok(actions) => {
                st.seen.record_ping(&ping);
                DispatchOutcome::accepted(actions)
            }
            Err(rejection) => {
                if rejection.misbehavior > 0 {
                    warn!(
                        "[popnode] ping for {} from {} rejected: {}",
                        ping.identity, peer, rejection
                    );
                } else {
                    debug!(
                        "[popnode] ping for {} from {} dropped: {}",
                        ping.identity, peer, rejection.reason
                    );
                }
                DispatchOutcome::rejected(rejection)
            }
        }
    }

    fn check_and_update_ping_locked(
        &self,
        st: &mut RegistryState,
        pos: usize,
        ping: &Ping,
        now: Timestamp,
    ) -> Result<Vec<OutboundAction>, Rejection> {
        let tip = st.tip_height();
        self.validate_ping(&st.entries()[pos], ping, false, now, tip)?;

        let ctx = self.check_context(st, now);
        let entry = &mut st.entries_mut()[pos];
        entry.last_ping = Some(ping.clone());
        let mnb_hash = Announcement::from_entry(entry).hash();
        self.check_entry_at(entry, &ctx, true);
        let relay = entry.state.is_valid_for_auto_start();
        st.seen.refresh_announcement_ping(&mnb_hash, ping);

        if !relay {
            return Ok(Vec::new());
        }
        Ok(vec![OutboundAction::Relay(Inventory::ping(ping.hash()))])
    }

    /// Ask `peer` for one entry, at most once per throttle window.
    pub fn ask_for_entry(&self, peer: SocketAddr, identity: NodeIdentity) -> Option<OutboundAction> {
        let now = self.now();
        let mut st = self.state.lock();
        self.ask_for_entry_locked(&mut st, peer, identity, now)
    }

    pub(crate) fn ask_for_entry_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        identity: NodeIdentity,
        now: Timestamp,
    ) -> Option<OutboundAction> {
        if !st.throttle.reserve_entry_ask(
            identity,
            peer.ip(),
            now,
            self.config.entry_request_interval_secs,
        ) {
            debug!("[popnode] already asked {} for {}", peer, identity);
            return None;
        }
        debug!("[popnode] asking {} for entry {}", peer, identity);
        Some(OutboundAction::Send {
            peer,
            message: GossipMessage::ListRequest(Some(identity)),
        })
    }

    /// Ask `peer` for its full list, at most once per throttle window.
    /// Local peers are never throttled.
    pub fn dseg_update(&self, peer: SocketAddr) -> Option<OutboundAction> {
        let now = self.now();
        let mut st = self.state.lock();
        if !is_local_addr(&peer.ip())
            && !st
                .throttle
                .reserve_list_ask(peer.ip(), now, self.config.list_request_interval_secs)
        {
            debug!("[popnode] already asked {} for the list", peer);
            return None;
        }
        debug!("[popnode] asking {} for the list", peer);
        Some(OutboundAction::Send {
            peer,
            message: GossipMessage::ListRequest(None),
        })
    }

    pub fn ask_for_announcement(&self, peer: SocketAddr, hash: Hash) -> OutboundAction {
        OutboundAction::RequestData {
            peer,
            inventory: vec![Inventory::announcement(hash)],
        }
    }

    /// Look up the gossip object behind an inventory item, to serve data
    /// requests from peers.
    pub fn lookup_inventory(&self, inventory: &Inventory) -> Option<GossipMessage> {
        let st = self.state.lock();
        match inventory.kind {
            InventoryKind::Announcement => st
                .seen
                .announcement(&inventory.hash)
                .cloned()
                .map(GossipMessage::Announce),
            InventoryKind::Ping => st
                .seen
                .ping(&inventory.hash)
                .cloned()
                .map(GossipMessage::Ping),
            InventoryKind::Verification => st
                .seen
                .verification(&inventory.hash)
                .cloned()
                .map(GossipMessage::VerifyBroadcast),
        }
    }
}
