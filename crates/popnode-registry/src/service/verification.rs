//! Proof-of-service verification: challenge, reply, countersigned
//! broadcast, and the same-address check.

use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::domain::{
    DispatchOutcome, GossipMessage, Inventory, OutboundAction, RegistryState, RejectReason,
    Rejection, Timestamp, Verification, VerificationStatus,
};
use crate::service::PopnodeRegistry;

impl PopnodeRegistry {
    /// Challenge up to `max_pose_connections` entries ranked below us.
    ///
    /// Only runs when we are an active popnode ranked in the top
    /// `max_pose_rank`. Starts at rank `max_pose_rank + my_rank` and moves
    /// in strides of `max_pose_connections`, so the top verifiers cover
    /// disjoint slices of the list.
    pub fn do_full_verification_step(&self) -> Vec<OutboundAction> {
        let Some(local) = &self.local else {
            return Vec::new();
        };
        if !self.chain.is_list_synced() {
            return Vec::new();
        }

        let now = self.now();
        let mut state = self.state.lock();
        let st = &mut *state;
        let Some(tip) = st.tip_height() else {
            return Vec::new();
        };
        let height = tip.saturating_sub(1);
        let ranks = self.ranks_locked(st, height, Some(self.config.min_pose_protocol), now);

        let mut my_rank = None;
        for (rank, entry) in &ranks {
            if *rank > self.config.max_pose_rank {
                break;
            }
            if entry.identity == local.identity {
                my_rank = Some(*rank);
                break;
            }
        }
        let Some(my_rank) = my_rank else {
            debug!("[popnode] not in the top {} verifiers", self.config.max_pose_rank);
            return Vec::new();
        };

        let mut candidates: Vec<SocketAddr> = st.entries().iter().map(|e| e.addr).collect();
        candidates.sort();

        let stride = self.config.max_pose_connections.max(1);
        let mut offset = self.config.max_pose_rank + my_rank - 1;
        let mut actions = Vec::new();
        while offset < ranks.len() && actions.len() < self.config.max_pose_connections {
            let target = &ranks[offset].1;
            if target.is_pose_verified(&self.config) || target.is_pose_banned() {
                debug!(
                    "[popnode] skipping {} (score {})",
                    target.identity, target.pose_ban_score
                );
            } else if let Some(action) =
                self.send_verify_request_locked(st, target.addr, &candidates, now, tip)
            {
                actions.push(action);
            }
            offset += stride;
        }
        info!("[popnode] sent {} verification requests", actions.len());
        actions
    }

    /// Challenge the popnode at `addr`. `candidates` are the known
    /// addresses, sorted.
    pub fn send_verify_request(
        &self,
        addr: SocketAddr,
        candidates: &[SocketAddr],
    ) -> Option<OutboundAction> {
        let now = self.now();
        let mut st = self.state.lock();
        let tip = st.tip_height()?;
        self.send_verify_request_locked(&mut st, addr, candidates, now, tip)
    }

    pub(crate) fn send_verify_request_locked(
        &self,
        st: &mut RegistryState,
        addr: SocketAddr,
        candidates: &[SocketAddr],
        now: Timestamp,
        tip: u64,
    ) -> Option<OutboundAction> {
        if !st
            .verifications
            .can_request(&addr, now, self.config.verification_request_expiry_secs)
        {
            debug!("[popnode] verification of {} already pending", addr);
            return None;
        }
        if candidates.binary_search(&addr).is_err() {
            debug!("[popnode] no popnode at {}", addr);
            return None;
        }

        let nonce = self.rng.gen_range(u64::from(u32::MAX) + 1) as u32;
        let challenge = Verification::request(addr, nonce, tip.saturating_sub(1));
        st.verifications.record_request(challenge.clone(), now);
        debug!(
            "[popnode] verification request to {} at height {}",
            addr, challenge.block_height
        );
        Some(OutboundAction::Send {
            peer: addr,
            message: GossipMessage::VerifyRequest(challenge),
        })
    }

    /// The session layer put the request to `addr` on the wire.
    pub fn confirm_verify_dispatch(&self, addr: &SocketAddr) -> bool {
        self.state.lock().verifications.mark_dispatched(addr)
    }

    pub fn verification_status(&self, addr: &SocketAddr) -> VerificationStatus {
        self.state.lock().verifications.status(addr)
    }

    /// Answer a challenge with our node key.
    pub fn send_verify_reply(&self, peer: SocketAddr, request: Verification) -> DispatchOutcome {
        let now = self.now();
        let mut st = self.state.lock();
        self.send_verify_reply_locked(&mut st, peer, request, now)
    }

    pub(crate) fn send_verify_reply_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        request: Verification,
        now: Timestamp,
    ) -> DispatchOutcome {
        let Some(local) = &self.local else {
            return DispatchOutcome::ignored();
        };
        if st
            .verifications
            .has_replied_within(&peer, now, self.config.verification_request_expiry_secs)
        {
            warn!("[popnode] {} repeated a verification request", peer);
            return DispatchOutcome::rejected(Rejection::new(
                RejectReason::VerificationRepeated,
                20,
            ));
        }
        let Some(block_hash) = self.chain.block_hash(request.block_height) else {
            debug!(
                "[popnode] no block at height {} for verification",
                request.block_height
            );
            return DispatchOutcome::ignored();
        };

        let message = Verification::reply_message(&local.addr, request.nonce, &block_hash);
        let sig1 = match local.signer.sign(&message) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("[popnode] failed to sign verification reply: {}", e);
                return DispatchOutcome::ignored();
            }
        };
        if !self.verify_signature(&local.signer.public_key(), &message, &sig1) {
            warn!("[popnode] own verification signature does not verify");
            return DispatchOutcome::ignored();
        }

        let mut reply = request;
        reply.sig1 = sig1;
        st.verifications.record_reply(peer, now);
        DispatchOutcome::accepted(vec![OutboundAction::Send {
            peer,
            message: GossipMessage::VerifyReply(reply),
        }])
    }

    pub fn process_verify_reply(&self, peer: SocketAddr, reply: Verification) -> DispatchOutcome {
        let now = self.now();
        let mut st = self.state.lock();
        self.process_verify_reply_locked(&mut st, peer, reply, now)
    }

    pub(crate) fn process_verify_reply_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        reply: Verification,
        now: Timestamp,
    ) -> DispatchOutcome {
        let Some(pending) = st.verifications.pending(&peer).cloned() else {
            warn!("[popnode] unsolicited verification reply from {}", peer);
            return DispatchOutcome::rejected(Rejection::new(
                RejectReason::VerificationNotRequested,
                20,
            ));
        };
        match pending.status {
            VerificationStatus::Verified => {
                return DispatchOutcome::rejected(Rejection::new(
                    RejectReason::AlreadyVerified,
                    20,
                ));
            }
            VerificationStatus::RequestSent | VerificationStatus::AwaitingReply => {}
            _ => {
                return DispatchOutcome::rejected(Rejection::new(
                    RejectReason::VerificationNotRequested,
                    20,
                ));
            }
        }
        let too_deep = st
            .tip_height()
            .is_some_and(|tip| pending.challenge.block_height + self.config.max_pose_blocks < tip);
        if now - pending.requested_at >= self.config.verification_request_expiry_secs || too_deep {
            debug!(
                "[popnode] verification reply from {} after the challenge expired",
                peer
            );
            st.verifications.mark_timed_out(&peer);
            return DispatchOutcome::rejected(Rejection::silent(RejectReason::VerificationExpired));
        }
        if pending.challenge.nonce != reply.nonce {
            st.verifications.mark_failed(&peer);
            return DispatchOutcome::rejected(Rejection::new(RejectReason::NonceMismatch, 20));
        }
        if pending.challenge.block_height != reply.block_height {
            st.verifications.mark_failed(&peer);
            return DispatchOutcome::rejected(Rejection::new(RejectReason::HeightMismatch, 20));
        }
        let Some(block_hash) = self.chain.block_hash(reply.block_height) else {
            debug!("[popnode] no block at height {}", reply.block_height);
            return DispatchOutcome::ignored();
        };

        let message = Verification::reply_message(&peer, reply.nonce, &block_hash);
        let mut genuine = None;
        let mut impostors = Vec::new();
        for (i, entry) in st.entries().iter().enumerate() {
            if entry.addr != peer {
                continue;
            }
            if self.verify_signature(&entry.node_key, &message, &reply.sig1) {
                genuine = Some(i);
            } else {
                impostors.push(i);
            }
        }
        let Some(genuine) = genuine else {
            st.verifications.mark_failed(&peer);
            warn!("[popnode] no popnode at {} signed the challenge", peer);
            return DispatchOutcome::rejected(Rejection::new(RejectReason::NoMatchingEntry, 20));
        };

        st.verifications.mark_verified(&peer);
        let (verified_identity, verified_addr) = {
            let entry = &mut st.entries_mut()[genuine];
            if !entry.is_pose_verified(&self.config) {
                entry.decrease_pose_ban_score(&self.config);
            }
            (entry.identity, entry.addr)
        };
        for i in &impostors {
            st.entries_mut()[*i].increase_pose_ban_score(&self.config);
        }
        info!(
            "[popnode] verified {} at {}, {} impostors penalized",
            verified_identity,
            peer,
            impostors.len()
        );

        let mut actions = Vec::new();
        if let Some(local) = &self.local {
            let mut broadcast = reply;
            broadcast.identity1 = Some(verified_identity);
            broadcast.identity2 = Some(local.identity);
            broadcast.addr = verified_addr;
            let message = Verification::broadcast_message(
                &verified_addr,
                broadcast.nonce,
                &block_hash,
                &verified_identity,
                &local.identity,
            );
            match local.signer.sign(&message) {
                Ok(sig2) => {
                    broadcast.sig2 = sig2;
                    st.seen.record_verification(&broadcast);
                    actions.push(OutboundAction::Relay(Inventory::verification(
                        broadcast.hash(),
                    )));
                }
                Err(e) => warn!("[popnode] failed to countersign verification: {}", e),
            }
        }
        DispatchOutcome::accepted(actions)
    }

    pub fn process_verify_broadcast(
        &self,
        peer: SocketAddr,
        broadcast: Verification,
    ) -> DispatchOutcome {
        let now = self.now();
        let mut st = self.state.lock();
        self.process_verify_broadcast_locked(&mut st, peer, broadcast, now)
    }

    pub(crate) fn process_verify_broadcast_locked(
        &self,
        st: &mut RegistryState,
        peer: SocketAddr,
        broadcast: Verification,
        now: Timestamp,
    ) -> DispatchOutcome {
        let hash = broadcast.hash();
        if st.seen.has_verification(&hash) {
            return DispatchOutcome::ignored();
        }
        st.seen.record_verification(&broadcast);

        let Some(tip) = st.tip_height() else {
            return DispatchOutcome::ignored();
        };
        if broadcast.block_height + self.config.max_pose_blocks < tip {
            debug!(
                "[popnode] outdated verification from {} (height {}, tip {})",
                peer, broadcast.block_height, tip
            );
            return DispatchOutcome::ignored();
        }
        let (Some(id1), Some(id2)) = (broadcast.identity1, broadcast.identity2) else {
            return DispatchOutcome::rejected(Rejection::silent(
                RejectReason::IncompleteVerification,
            ));
        };
        if id1 == id2 {
            warn!("[popnode] verification from {} names {} twice", peer, id1);
            return DispatchOutcome::rejected(Rejection::new(RejectReason::SameIdentities, 100));
        }
        let Some(block_hash) = self.chain.block_hash(broadcast.block_height) else {
            return DispatchOutcome::ignored();
        };

        let ranks = self.ranks_locked(
            st,
            broadcast.block_height,
            Some(self.config.min_pose_protocol),
            now,
        );
        let Some(verifier_rank) = ranks
            .iter()
            .find(|(_, e)| e.identity == id2)
            .map(|(rank, _)| *rank)
        else {
            debug!("[popnode] verifier {} has no rank", id2);
            return DispatchOutcome::ignored();
        };
        if verifier_rank > self.config.max_pose_rank {
            debug!(
                "[popnode] verifier {} ranked {}, outside the top {}",
                id2, verifier_rank, self.config.max_pose_rank
            );
            return DispatchOutcome::ignored();
        }

        let (Some(pos1), Some(pos2)) = (st.position(&id1), st.position(&id2)) else {
            return DispatchOutcome::ignored();
        };
        let verified = &st.entries()[pos1];
        let verifier = &st.entries()[pos2];
        if verified.addr != broadcast.addr {
            debug!(
                "[popnode] verification address {} does not match {}",
                broadcast.addr, verified.addr
            );
            return DispatchOutcome::ignored();
        }

        let reply_message =
            Verification::reply_message(&broadcast.addr, broadcast.nonce, &block_hash);
        if !self.verify_signature(&verified.node_key, &reply_message, &broadcast.sig1) {
            return DispatchOutcome::rejected(Rejection::silent(RejectReason::InvalidSignature));
        }
        let broadcast_message = Verification::broadcast_message(
            &broadcast.addr,
            broadcast.nonce,
            &block_hash,
            &id1,
            &id2,
        );
        if !self.verify_signature(&verifier.node_key, &broadcast_message, &broadcast.sig2) {
            return DispatchOutcome::rejected(Rejection::silent(RejectReason::InvalidSignature));
        }

        {
            let verified = &mut st.entries_mut()[pos1];
            if !verified.is_pose_verified(&self.config) {
                verified.decrease_pose_ban_score(&self.config);
            }
        }
        let mut penalized = 0;
        for entry in st.entries_mut() {
            if entry.addr == broadcast.addr && entry.identity != id1 {
                entry.increase_pose_ban_score(&self.config);
                penalized += 1;
            }
        }
        info!(
            "[popnode] {} verified {} at {}, {} others penalized",
            id2, id1, broadcast.addr, penalized
        );
        DispatchOutcome::accepted(vec![OutboundAction::Relay(Inventory::verification(hash))])
    }

    /// Penalize entries sharing an address with a verified entry.
    ///
    /// Walks (pre-)enabled entries sorted by address. Within a group, once
    /// an entry is verified the unverified members around it are penalized.
    pub fn check_same_addr(&self) -> usize {
        if !self.chain.is_list_synced() {
            return 0;
        }
        let mut st = self.state.lock();
        if st.is_empty() {
            return 0;
        }

        let mut order: Vec<usize> = st
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_enabled() || e.is_pre_enabled())
            .map(|(i, _)| i)
            .collect();
        order.sort_by_key(|i| st.entries()[*i].addr);

        let mut to_ban = Vec::new();
        let mut prev: Option<usize> = None;
        let mut verified_in_group = false;
        for &i in &order {
            let entry = &st.entries()[i];
            let is_verified = entry.is_pose_verified(&self.config);
            match prev {
                Some(p) if st.entries()[p].addr == entry.addr => {
                    if verified_in_group {
                        to_ban.push(i);
                    } else if is_verified {
                        to_ban.push(p);
                        verified_in_group = true;
                    }
                }
                _ => verified_in_group = is_verified,
            }
            prev = Some(i);
        }

        for &i in &to_ban {
            let entry = &mut st.entries_mut()[i];
            entry.increase_pose_ban_score(&self.config);
            debug!(
                "[popnode] {} shares an address with a verified popnode, score {}",
                entry.identity, entry.pose_ban_score
            );
        }
        to_ban.len()
    }
}
