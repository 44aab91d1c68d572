//! # Registry State
//!
//! The aggregate guarded by the registry lock: the live entries, both
//! identity index snapshots, the throttle, seen, verification and recovery
//! tables, and the change flags.

use std::collections::HashMap;
use std::fmt;
use tracing::info;

use crate::domain::config::RegistryConfig;
use crate::domain::entry::NodeEntry;
use crate::domain::index::IdentityIndex;
use crate::domain::recovery::RecoveryBook;
use crate::domain::seen::SeenTables;
use crate::domain::throttle::ThrottleTables;
use crate::domain::types::{BlockHeight, Hash, NodeIdentity, PayeeScript, PublicKey, Timestamp};
use crate::domain::verification::VerificationBook;

#[derive(Debug, Default)]
pub struct RegistryState {
    entries: Vec<NodeEntry>,
    positions: HashMap<NodeIdentity, usize>,
    pub(crate) index: IdentityIndex,
    pub(crate) index_old: IdentityIndex,
    pub(crate) index_rebuilt: bool,
    pub(crate) last_index_rebuild: Timestamp,
    pub(crate) added: bool,
    pub(crate) removed: bool,
    pub(crate) throttle: ThrottleTables,
    pub(crate) verifications: VerificationBook,
    pub(crate) recovery: RecoveryBook,
    pub(crate) seen: SeenTables,
    pub(crate) last_watchdog_vote: Timestamp,
    pub(crate) dsq_count: i64,
    pub(crate) tip: Option<(BlockHeight, Hash)>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    /// Mutable view; entries cannot be added, removed or reordered through it.
    pub fn entries_mut(&mut self) -> &mut [NodeEntry] {
        &mut self.entries
    }

    pub fn position(&self, identity: &NodeIdentity) -> Option<usize> {
        self.positions.get(identity).copied()
    }

    pub fn find(&self, identity: &NodeIdentity) -> Option<&NodeEntry> {
        self.position(identity).map(|i| &self.entries[i])
    }

    pub fn find_mut(&mut self, identity: &NodeIdentity) -> Option<&mut NodeEntry> {
        match self.position(identity) {
            Some(i) => Some(&mut self.entries[i]),
            None => None,
        }
    }

    pub fn find_by_node_key(&self, key: &PublicKey) -> Option<&NodeEntry> {
        self.entries.iter().find(|e| &e.node_key == key)
    }

    pub fn find_by_payee(&self, payee: &PayeeScript) -> Option<&NodeEntry> {
        self.entries.iter().find(|e| &e.payee() == payee)
    }

    pub fn tip_height(&self) -> Option<BlockHeight> {
        self.tip.map(|(height, _)| height)
    }

    /// Append a well-formed entry with a new identity and index it.
    pub fn add(&mut self, entry: NodeEntry) -> bool {
        if !entry.is_well_formed() || self.positions.contains_key(&entry.identity) {
            return false;
        }
        self.index.assign(entry.identity);
        self.positions.insert(entry.identity, self.entries.len());
        self.entries.push(entry);
        self.added = true;
        true
    }

    /// Remove every entry matching `pred`, keeping collection order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<NodeEntry>
    where
        F: FnMut(&NodeEntry) -> bool,
    {
        let (removed, kept): (Vec<NodeEntry>, Vec<NodeEntry>) =
            std::mem::take(&mut self.entries).into_iter().partition(|e| pred(e));
        self.entries = kept;
        if !removed.is_empty() {
            self.reindex_positions();
            self.removed = true;
        }
        removed
    }

    fn reindex_positions(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.identity, i))
            .collect();
    }

    /// Rebuild the identity index from the live entries when it has grown
    /// past the expected size, holds stale identities, and the previous
    /// rebuild is old enough. The replaced index is kept as "old".
    pub fn rebuild_index_if_needed(&mut self, now: Timestamp, config: &RegistryConfig) -> bool {
        if now - self.last_index_rebuild < config.min_index_rebuild_secs {
            return false;
        }
        let size = self.index.size();
        if size <= config.max_expected_index_size || size <= self.entries.len() {
            return false;
        }

        self.index_old = std::mem::take(&mut self.index);
        for entry in &self.entries {
            self.index.assign(entry.identity);
        }
        self.index_rebuilt = true;
        self.last_index_rebuild = now;
        info!(
            "[popnode] identity index rebuilt: {} -> {} identities",
            self.index_old.size(),
            self.index.size()
        );
        true
    }

    /// Restore a persisted collection. Positions are derived, the index
    /// is taken as persisted.
    pub(crate) fn restore(
        &mut self,
        entries: Vec<NodeEntry>,
        index: IdentityIndex,
    ) {
        self.entries = entries;
        self.index = index;
        self.reindex_positions();
    }

    /// Reset to empty. The chain tip is runtime state and survives.
    pub fn clear(&mut self) {
        let tip = self.tip;
        *self = Self::default();
        self.tip = tip;
    }
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (asked_us, we_asked, we_asked_entry) = self.throttle.len();
        write!(
            f,
            "Popnodes: {}, peers who asked us for the list: {}, peers we asked for the list: {}, \
             entries we asked for: {}, identity index size: {}, pending recoveries: {}, \
             scheduled connections: {}, dsq count: {}",
            self.entries.len(),
            asked_us,
            we_asked,
            we_asked_entry,
            self.index.size(),
            self.recovery.pending_len(),
            self.recovery.scheduled_len(),
            self.dsq_count
        )
    }
}
