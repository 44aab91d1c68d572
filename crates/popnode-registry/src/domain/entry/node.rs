use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, info};

use super::{Announcement, Ping, PopnodeState};
use crate::domain::config::RegistryConfig;
use crate::domain::types::{
    BlockHeight, NodeIdentity, PayeeScript, PublicKey, Signature, Timestamp,
};

/// Chain and registry facts a liveness check depends on.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext {
    pub now: Timestamp,
    /// Current tip height, 0 before the first tip notification.
    pub height: BlockHeight,
    /// The node list has finished its initial sync.
    pub list_synced: bool,
    pub watchdog_active: bool,
    /// Live entry count, used to size PoSe bans.
    pub registry_size: usize,
}

/// One popnode as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    pub collateral_key: PublicKey,
    pub node_key: PublicKey,
    pub signature: Signature,
    pub sig_time: Timestamp,
    pub protocol_version: u32,
    pub last_ping: Option<Ping>,
    pub state: PopnodeState,
    pub last_checked: Timestamp,
    pub last_dsq: i64,
    pub last_paid_time: Timestamp,
    pub last_paid_block: BlockHeight,
    pub pose_ban_score: i32,
    pub pose_ban_height: BlockHeight,
    pub last_watchdog_vote: Timestamp,
}

impl NodeEntry {
    pub fn from_announcement(announcement: &Announcement) -> Self {
        Self {
            identity: announcement.identity,
            addr: announcement.addr,
            collateral_key: announcement.collateral_key.clone(),
            node_key: announcement.node_key.clone(),
            signature: announcement.signature.clone(),
            sig_time: announcement.sig_time,
            protocol_version: announcement.protocol_version,
            last_ping: announcement.last_ping.clone(),
            state: PopnodeState::PreEnabled,
            last_checked: 0,
            last_dsq: 0,
            last_paid_time: 0,
            last_paid_block: 0,
            pose_ban_score: 0,
            pose_ban_height: 0,
            last_watchdog_vote: announcement.sig_time,
        }
    }

    pub fn payee(&self) -> PayeeScript {
        PayeeScript::for_key(&self.collateral_key)
    }

    /// Entries failing this are never admitted to the registry.
    pub fn is_well_formed(&self) -> bool {
        !self.identity.is_null()
            && self.collateral_key.is_well_formed()
            && self.node_key.is_well_formed()
            && self.addr.port() != 0
            && !self.addr.ip().is_unspecified()
    }

    pub fn is_enabled(&self) -> bool {
        self.state == PopnodeState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == PopnodeState::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == PopnodeState::PoseBan
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == PopnodeState::NewStartRequired
    }

    pub fn is_update_required(&self) -> bool {
        self.state == PopnodeState::UpdateRequired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == PopnodeState::OutpointSpent
    }

    pub fn is_pose_verified(&self, config: &RegistryConfig) -> bool {
        self.pose_ban_score <= config.pose_verified_score()
    }

    pub fn increase_pose_ban_score(&mut self, config: &RegistryConfig) {
        if self.pose_ban_score < config.pose_ban_max_score {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self, config: &RegistryConfig) {
        if self.pose_ban_score > config.pose_verified_score() {
            self.pose_ban_score -= 1;
        }
    }

    /// True if the last ping was signed within `seconds` before `at`.
    pub fn is_pinged_within(&self, seconds: i64, at: Timestamp) -> bool {
        match &self.last_ping {
            Some(ping) => at - ping.sig_time < seconds,
            None => false,
        }
    }

    pub fn is_broadcasted_within(&self, seconds: i64, now: Timestamp) -> bool {
        now - self.sig_time < seconds
    }

    pub fn last_ping_time(&self) -> Timestamp {
        self.last_ping.as_ref().map(|p| p.sig_time).unwrap_or(0)
    }

    /// Whether [`NodeEntry::check`] should run now.
    pub fn needs_check(&self, now: Timestamp, force: bool, config: &RegistryConfig) -> bool {
        if self.is_outpoint_spent() {
            return false;
        }
        force || now - self.last_checked >= config.check_interval_secs
    }

    /// Re-derive the liveness state.
    ///
    /// `collateral_spent` is the ledger's verdict for this identity. Callers
    /// gate on [`NodeEntry::needs_check`] first.
    pub fn check(&mut self, ctx: &CheckContext, collateral_spent: bool, config: &RegistryConfig) {
        self.last_checked = ctx.now;

        if collateral_spent {
            self.set_state(PopnodeState::OutpointSpent);
            return;
        }

        if self.is_pose_banned() {
            if ctx.height < self.pose_ban_height {
                return;
            }
            info!(
                "[popnode] {} unbanned at height {}, score {}",
                self.identity, ctx.height, self.pose_ban_score
            );
            self.decrease_pose_ban_score(config);
        } else if self.pose_ban_score >= config.pose_ban_max_score {
            self.pose_ban_height = ctx.height + ctx.registry_size as BlockHeight;
            info!(
                "[popnode] {} PoSe banned until height {}",
                self.identity, self.pose_ban_height
            );
            self.set_state(PopnodeState::PoseBan);
            return;
        }

        if self.protocol_version < config.min_payments_protocol {
            self.set_state(PopnodeState::UpdateRequired);
            return;
        }

        // Right after start-up the list is incomplete; do not demote on
        // missing pings until the node had a chance to hear one.
        let waiting_for_ping =
            !ctx.list_synced && !self.is_pinged_within(config.min_ping_interval_secs, ctx.now);
        if waiting_for_ping
            && matches!(
                self.state,
                PopnodeState::Expired
                    | PopnodeState::WatchdogExpired
                    | PopnodeState::NewStartRequired
            )
        {
            return;
        }

        if !waiting_for_ping {
            if !self.is_pinged_within(config.new_start_required_secs, ctx.now) {
                self.set_state(PopnodeState::NewStartRequired);
                return;
            }
            if ctx.watchdog_active && ctx.now - self.last_watchdog_vote > config.watchdog_max_secs
            {
                self.set_state(PopnodeState::WatchdogExpired);
                return;
            }
            if !self.is_pinged_within(config.expiration_secs, ctx.now) {
                self.set_state(PopnodeState::Expired);
                return;
            }
        }

        if self.last_ping_time() - self.sig_time < config.min_ping_interval_secs {
            self.set_state(PopnodeState::PreEnabled);
            return;
        }

        self.set_state(PopnodeState::Enabled);
    }

    fn set_state(&mut self, state: PopnodeState) {
        if self.state != state {
            debug!(
                "[popnode] {} state {} -> {}",
                self.identity, self.state, state
            );
            self.state = state;
        }
    }

    /// Copy the fields of a newer announcement, resetting PoSe data.
    ///
    /// The embedded ping is handled by the caller, which must validate it
    /// first.
    pub fn apply_announcement(&mut self, announcement: &Announcement) {
        self.node_key = announcement.node_key.clone();
        self.sig_time = announcement.sig_time;
        self.signature = announcement.signature.clone();
        self.protocol_version = announcement.protocol_version;
        self.addr = announcement.addr;
        self.pose_ban_score = 0;
        self.pose_ban_height = 0;
        self.last_checked = 0;
    }
}
