//! # Identity Index
//!
//! Bijection between node identities and small dense integers, used by
//! compact vote and payment encodings. Indices are handed out in arrival
//! order and never reused until a full rebuild.
//!
//! Only the forward map is persisted. The reverse map and size are
//! reconstructed on deserialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::types::NodeIdentity;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PersistedIndex", into = "PersistedIndex")]
pub struct IdentityIndex {
    size: u32,
    forward: BTreeMap<NodeIdentity, u32>,
    reverse: BTreeMap<u32, NodeIdentity>,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    forward: BTreeMap<NodeIdentity, u32>,
}

impl From<PersistedIndex> for IdentityIndex {
    fn from(persisted: PersistedIndex) -> Self {
        let mut index = IdentityIndex {
            size: 0,
            forward: persisted.forward,
            reverse: BTreeMap::new(),
        };
        index.rebuild();
        index
    }
}

impl From<IdentityIndex> for PersistedIndex {
    fn from(index: IdentityIndex) -> Self {
        PersistedIndex {
            forward: index.forward,
        }
    }
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, index: u32) -> Option<NodeIdentity> {
        self.reverse.get(&index).copied()
    }

    pub fn index_of(&self, identity: &NodeIdentity) -> Option<u32> {
        self.forward.get(identity).copied()
    }

    /// Assign the next index to `identity`; no-op if it already has one.
    pub fn assign(&mut self, identity: NodeIdentity) -> u32 {
        if let Some(existing) = self.forward.get(&identity) {
            return *existing;
        }
        let next = self.size;
        self.forward.insert(identity, next);
        self.reverse.insert(next, identity);
        self.size += 1;
        next
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.size = 0;
    }

    /// Reconstruct the reverse map and size from the forward map.
    pub fn rebuild(&mut self) {
        self.reverse = self.forward.iter().map(|(id, i)| (*i, *id)).collect();
        self.size = self.forward.len() as u32;
    }
}
