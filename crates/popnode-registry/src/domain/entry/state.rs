use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PopnodeState {
    /// Announced, first ping not yet far enough past the announcement.
    PreEnabled,
    Enabled,
    /// No ping within the expiration window.
    Expired,
    /// Collateral has been spent; removed on the next sweep.
    OutpointSpent,
    /// Protocol version below the payments floor.
    UpdateRequired,
    /// Watchdog is active and this node's vote is stale.
    WatchdogExpired,
    /// No ping for so long that only a new announcement revives it.
    NewStartRequired,
    /// Banned by proof-of-service scoring until the ban height.
    PoseBan,
}

impl PopnodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PopnodeState::PreEnabled => "PRE_ENABLED",
            PopnodeState::Enabled => "ENABLED",
            PopnodeState::Expired => "EXPIRED",
            PopnodeState::OutpointSpent => "OUTPOINT_SPENT",
            PopnodeState::UpdateRequired => "UPDATE_REQUIRED",
            PopnodeState::WatchdogExpired => "WATCHDOG_EXPIRED",
            PopnodeState::NewStartRequired => "NEW_START_REQUIRED",
            PopnodeState::PoseBan => "POSE_BAN",
        }
    }

    /// States from which a node may restart itself without a new collateral
    /// announcement. Recovery replies must simulate to one of these.
    pub fn is_valid_for_auto_start(&self) -> bool {
        matches!(
            self,
            PopnodeState::Enabled
                | PopnodeState::PreEnabled
                | PopnodeState::Expired
                | PopnodeState::WatchdogExpired
        )
    }
}

impl fmt::Display for PopnodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
