use serde::{Deserialize, Serialize};

use crate::domain::types::{hash_serialized, Hash, NodeIdentity, Signature, Timestamp};

/// Liveness proof signed with the node key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub identity: NodeIdentity,
    /// A recent block, proving the ping was made on the current chain.
    pub block_hash: Hash,
    pub sig_time: Timestamp,
    pub signature: Signature,
}

impl Ping {
    /// Unsigned ping; sign [`Ping::signing_message`] and set `signature`.
    pub fn new(identity: NodeIdentity, block_hash: Hash, sig_time: Timestamp) -> Self {
        Self {
            identity,
            block_hash,
            sig_time,
            signature: Signature::default(),
        }
    }

    /// Dedup key: `H(identity, sig_time)`.
    pub fn hash(&self) -> Hash {
        hash_serialized(&(&self.identity, self.sig_time))
    }

    pub fn signing_message(&self) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.identity,
            hex::encode(self.block_hash),
            self.sig_time
        )
        .into_bytes()
    }

    /// A ping older than `max_age` seconds is no longer kept in the seen table.
    pub fn is_expired(&self, now: Timestamp, max_age: i64) -> bool {
        now - self.sig_time > max_age
    }
}
