//! Gossip messages accepted by the dispatcher and the outbound actions it
//! decides on. Actions are executed by the caller after the registry lock
//! is released.

use std::net::SocketAddr;

use crate::domain::entry::{Announcement, Ping};
use crate::domain::rejection::Rejection;
use crate::domain::types::{Hash, NodeIdentity};
use crate::domain::verification::{Verification, VerificationPhase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// Full list (`None`) or a single entry.
    ListRequest(Option<NodeIdentity>),
    Announce(Announcement),
    Ping(Ping),
    VerifyRequest(Verification),
    VerifyReply(Verification),
    VerifyBroadcast(Verification),
}

impl GossipMessage {
    /// Wrap a verification in the message matching its phase.
    pub fn verification(verification: Verification) -> Self {
        match verification.phase() {
            VerificationPhase::Request => GossipMessage::VerifyRequest(verification),
            VerificationPhase::Reply => GossipMessage::VerifyReply(verification),
            VerificationPhase::Broadcast => GossipMessage::VerifyBroadcast(verification),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::ListRequest(_) => "dseg",
            GossipMessage::Announce(_) => "mnb",
            GossipMessage::Ping(_) => "mnp",
            GossipMessage::VerifyRequest(_) => "mnv-request",
            GossipMessage::VerifyReply(_) => "mnv-reply",
            GossipMessage::VerifyBroadcast(_) => "mnv-broadcast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryKind {
    Announcement,
    Ping,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub kind: InventoryKind,
    pub hash: Hash,
}

impl Inventory {
    pub fn announcement(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Announcement,
            hash,
        }
    }

    pub fn ping(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Ping,
            hash,
        }
    }

    pub fn verification(hash: Hash) -> Self {
        Self {
            kind: InventoryKind::Verification,
            hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Send a message to one peer, connecting first if needed.
    Send {
        peer: SocketAddr,
        message: GossipMessage,
    },
    /// Advertise inventory to one peer.
    PushInventory {
        peer: SocketAddr,
        inventory: Inventory,
    },
    /// Ask one peer for the data behind inventory.
    RequestData {
        peer: SocketAddr,
        inventory: Vec<Inventory>,
    },
    /// Advertise inventory to every connected peer.
    Relay(Inventory),
    /// Tell a peer how many list items were pushed to it.
    SyncCount { peer: SocketAddr, count: usize },
}

/// Result of dispatching one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub actions: Vec<OutboundAction>,
    pub rejection: Option<Rejection>,
}

impl DispatchOutcome {
    pub fn accepted(actions: Vec<OutboundAction>) -> Self {
        Self {
            actions,
            rejection: None,
        }
    }

    pub fn ignored() -> Self {
        Self::default()
    }

    pub fn rejected(rejection: Rejection) -> Self {
        Self {
            actions: Vec::new(),
            rejection: Some(rejection),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    pub fn misbehavior(&self) -> u32 {
        self.rejection.map(|r| r.misbehavior).unwrap_or(0)
    }
}
