use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::{NodeEntry, Ping};
use crate::domain::config::RegistryConfig;
use crate::domain::rejection::{RejectReason, Rejection};
use crate::domain::types::{hash_serialized, Hash, NodeIdentity, PublicKey, Signature, Timestamp};

/// Signed registration of a popnode, made with the collateral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    pub collateral_key: PublicKey,
    pub node_key: PublicKey,
    pub signature: Signature,
    pub sig_time: Timestamp,
    pub protocol_version: u32,
    pub last_ping: Option<Ping>,
    /// Set locally when the announcement is applied by a recovery quorum.
    #[serde(skip)]
    pub recovery: bool,
}

impl Announcement {
    /// Identity of the registration: `H(identity, collateral key, sig_time)`.
    ///
    /// Re-broadcasts of the same registration with a fresher ping share
    /// this hash; recovery requests are keyed by it.
    pub fn hash(&self) -> Hash {
        hash_serialized(&(&self.identity, &self.collateral_key, self.sig_time))
    }

    /// Hash over every field, including the embedded ping.
    pub fn content_hash(&self) -> Hash {
        hash_serialized(self)
    }

    pub fn signing_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            hex::encode(self.collateral_key.key_id()),
            hex::encode(self.node_key.key_id()),
            self.protocol_version
        )
        .into_bytes()
    }

    /// Rebuild the announcement an entry was created or last updated from.
    pub fn from_entry(entry: &NodeEntry) -> Self {
        Self {
            identity: entry.identity,
            addr: entry.addr,
            collateral_key: entry.collateral_key.clone(),
            node_key: entry.node_key.clone(),
            signature: entry.signature.clone(),
            sig_time: entry.sig_time,
            protocol_version: entry.protocol_version,
            last_ping: entry.last_ping.clone(),
            recovery: false,
        }
    }

    pub fn last_ping_time(&self) -> Timestamp {
        self.last_ping.as_ref().map(|p| p.sig_time).unwrap_or(0)
    }

    /// Structural checks that need neither chain nor keys.
    pub fn check_shape(&self, now: Timestamp, config: &RegistryConfig) -> Result<(), Rejection> {
        if self.identity.is_null() {
            return Err(Rejection::new(RejectReason::MalformedAnnouncement, 100));
        }
        if self.sig_time > now + config.max_signature_drift_secs {
            return Err(Rejection::new(RejectReason::FutureSignatureTime, 1));
        }
        if !self.collateral_key.is_well_formed() || !self.node_key.is_well_formed() {
            return Err(Rejection::new(RejectReason::BadKeyFormat, 100));
        }
        if self.addr.ip().is_unspecified() || self.addr.port() == 0 {
            return Err(Rejection::new(RejectReason::InvalidAddress, 0));
        }
        if let Some(port) = config.required_port {
            if self.addr.port() != port {
                return Err(Rejection::new(RejectReason::WrongPort, 0));
            }
        }
        Ok(())
    }
}
