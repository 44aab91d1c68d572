//! Registry configuration.

use serde::{Deserialize, Serialize};

/// Protocol constants and tunables of the registry.
///
/// `Default` carries the network values; `for_testing()` shrinks the index
/// rebuild thresholds so the rebuild policy can be exercised cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    // --- identity index -----------------------------------------------------
    /// Index size that must be exceeded before a rebuild is considered (default: 30000)
    pub max_expected_index_size: usize,
    /// Minimum seconds between two index rebuilds (default: 3600)
    pub min_index_rebuild_secs: i64,

    // --- gossip ---------------------------------------------------------------
    /// Throttle window for full-list requests, both directions (default: 3h)
    pub list_request_interval_secs: i64,
    /// Throttle window for asking one peer about one identity (default: 3h)
    pub entry_request_interval_secs: i64,
    /// Blocks scanned backwards when refreshing last-paid data (default: 100)
    pub last_paid_scan_blocks: u64,
    /// Allowed clock skew for announcement and ping signature times (default: 1h)
    pub max_signature_drift_secs: i64,
    /// Pings must reference one of the last N blocks (default: 24)
    pub max_ping_block_depth: u64,
    /// Required port for announced addresses, `None` accepts any
    pub required_port: Option<u16>,

    // --- liveness -------------------------------------------------------------
    /// Minimum seconds between two non-forced checks of one entry (default: 5)
    pub check_interval_secs: i64,
    /// Minimum seconds between accepted re-announcements (default: 300)
    pub min_announce_interval_secs: i64,
    /// Minimum seconds between pings (default: 600)
    pub min_ping_interval_secs: i64,
    /// Without a ping for this long an entry is expired (default: 65 min)
    pub expiration_secs: i64,
    /// Watchdog vote staleness limit (default: 120 min)
    pub watchdog_max_secs: i64,
    /// Without a ping for this long an entry needs a new start (default: 180 min)
    pub new_start_required_secs: i64,
    /// Extra time a new-start-required entry is kept before removal (default: 24h)
    pub new_start_removal_grace_secs: i64,
    /// Protocol floor for an entry to be considered current (default: 70100)
    pub min_payments_protocol: u32,

    // --- proof of service -----------------------------------------------------
    /// Score at which an entry is banned, negated for "verified" (default: 5)
    pub pose_ban_max_score: i32,
    /// Protocol floor for taking part in verification (default: 70203)
    pub min_pose_protocol: u32,
    /// Only the top N ranked nodes may verify (default: 10)
    pub max_pose_rank: usize,
    /// Verifications older than N blocks are ignored (default: 10)
    pub max_pose_blocks: u64,
    /// Requests sent per verification step, also the rank stride (default: 10)
    pub max_pose_connections: usize,
    /// Seconds a verification request or reply blocks a repeat (default: 1h)
    pub verification_request_expiry_secs: i64,

    // --- recovery ---------------------------------------------------------------
    /// Peers asked per recovery request (default: 10)
    pub recovery_quorum_total: usize,
    /// Matching replies needed to apply a recovery (default: 6)
    pub recovery_quorum_required: usize,
    /// Recovery requests opened per sweep (default: 10)
    pub recovery_max_ask_entries: usize,
    /// Reply window after a request (default: 60s)
    pub recovery_wait_secs: i64,
    /// A recovery for the same announcement can be retried after (default: 3h)
    pub recovery_retry_secs: i64,

    // --- background tasks -------------------------------------------------------
    /// Sweep interval for the maintenance task (default: 60s)
    pub sweep_interval_secs: u64,
    /// Verification step interval for an active popnode (default: 300s)
    pub verification_interval_secs: u64,
    /// Poll interval of the scheduled-connection drain (default: 1s)
    pub connection_drain_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_expected_index_size: 30_000,
            min_index_rebuild_secs: 3_600,
            list_request_interval_secs: 3 * 60 * 60,
            entry_request_interval_secs: 3 * 60 * 60,
            last_paid_scan_blocks: 100,
            max_signature_drift_secs: 60 * 60,
            max_ping_block_depth: 24,
            required_port: None,
            check_interval_secs: 5,
            min_announce_interval_secs: 5 * 60,
            min_ping_interval_secs: 10 * 60,
            expiration_secs: 65 * 60,
            watchdog_max_secs: 120 * 60,
            new_start_required_secs: 180 * 60,
            new_start_removal_grace_secs: 24 * 60 * 60,
            min_payments_protocol: 70_100,
            pose_ban_max_score: 5,
            min_pose_protocol: 70_203,
            max_pose_rank: 10,
            max_pose_blocks: 10,
            max_pose_connections: 10,
            verification_request_expiry_secs: 60 * 60,
            recovery_quorum_total: 10,
            recovery_quorum_required: 6,
            recovery_max_ask_entries: 10,
            recovery_wait_secs: 60,
            recovery_retry_secs: 3 * 60 * 60,
            sweep_interval_secs: 60,
            verification_interval_secs: 5 * 60,
            connection_drain_interval_secs: 1,
        }
    }
}

impl RegistryConfig {
    /// Create a config suitable for testing (small rebuild thresholds)
    pub fn for_testing() -> Self {
        Self {
            max_expected_index_size: 4,
            min_index_rebuild_secs: 60,
            sweep_interval_secs: 1,
            verification_interval_secs: 1,
            ..Self::default()
        }
    }

    /// Lowest PoSe score; an entry at or below it counts as verified.
    pub fn pose_verified_score(&self) -> i32 {
        -self.pose_ban_max_score
    }
}
