use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::domain::{
    rank_entries, Announcement, BlockHeight, CheckContext, NodeEntry, NodeIdentity, PayeeScript,
    Ping, PopnodeState, PublicKey, RegistryConfig, RegistryState, Signature, Timestamp,
};
use crate::ports::{
    ChainView, CollateralLedger, MembershipListener, MessageSigner, RandomSource,
    SignatureVerifier, TimeSource,
};

/// Outbound ports the registry needs.
#[derive(Clone)]
pub struct RegistryDeps {
    pub chain: Arc<dyn ChainView>,
    pub collateral: Arc<dyn CollateralLedger>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub clock: Arc<dyn TimeSource>,
    pub rng: Arc<dyn RandomSource>,
}

/// The popnode this process runs, if any. Required to answer and issue
/// verification challenges.
#[derive(Clone)]
pub struct LocalPopnode {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    pub signer: Arc<dyn MessageSigner>,
}

/// Popnode registry service.
///
/// # Example
///
/// ```rust,ignore
/// let registry = PopnodeRegistry::new(RegistryConfig::default(), deps)
///     .with_local_popnode(local);
///
/// registry.ledger_tip_changed(height, block_hash);
/// let winners = registry.rank_all(height, Some(70_203));
/// ```
pub struct PopnodeRegistry {
    pub(crate) config: RegistryConfig,
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) chain: Arc<dyn ChainView>,
    pub(crate) collateral: Arc<dyn CollateralLedger>,
    pub(crate) verifier: Arc<dyn SignatureVerifier>,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) rng: Arc<dyn RandomSource>,
    pub(crate) local: Option<LocalPopnode>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

impl PopnodeRegistry {
    pub fn new(config: RegistryConfig, deps: RegistryDeps) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::new()),
            chain: deps.chain,
            collateral: deps.collateral,
            verifier: deps.verifier,
            clock: deps.clock,
            rng: deps.rng,
            local: None,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn with_local_popnode(mut self, local: LocalPopnode) -> Self {
        self.local = Some(local);
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn local_popnode(&self) -> Option<&LocalPopnode> {
        self.local.as_ref()
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn is_local(&self, identity: &NodeIdentity) -> bool {
        self.local
            .as_ref()
            .is_some_and(|local| &local.identity == identity)
    }

    pub(crate) fn verify_signature(
        &self,
        key: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> bool {
        self.verifier.verify(key, message, signature)
    }

    pub(crate) fn check_context(&self, st: &RegistryState, now: Timestamp) -> CheckContext {
        let list_synced = self.chain.is_list_synced();
        CheckContext {
            now,
            height: st.tip_height().unwrap_or(0),
            list_synced,
            watchdog_active: list_synced
                && now - st.last_watchdog_vote <= self.config.watchdog_max_secs,
            registry_size: st.len(),
        }
    }

    pub(crate) fn check_entry_at(&self, entry: &mut NodeEntry, ctx: &CheckContext, force: bool) {
        if !entry.needs_check(ctx.now, force, &self.config) {
            return;
        }
        let spent = self.collateral.is_spent(&entry.identity);
        entry.check(ctx, spent, &self.config);
    }

    pub(crate) fn check_all_locked(&self, st: &mut RegistryState, now: Timestamp, force: bool) {
        let ctx = self.check_context(st, now);
        for entry in st.entries_mut() {
            self.check_entry_at(entry, &ctx, force);
        }
    }

    /// Check every entry, then rank the enabled ones at `height`.
    pub(crate) fn ranks_locked(
        &self,
        st: &mut RegistryState,
        height: BlockHeight,
        min_protocol: Option<u32>,
        now: Timestamp,
    ) -> Vec<(usize, NodeEntry)> {
        let Some(block_hash) = self.chain.block_hash(height) else {
            return Vec::new();
        };
        self.check_all_locked(st, now, false);
        rank_entries(st.entries(), &block_hash, min_protocol)
            .into_iter()
            .map(|(rank, entry)| (rank, entry.clone()))
            .collect()
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add an entry. Rejects duplicates and malformed entries.
    pub fn add(&self, entry: NodeEntry) -> bool {
        let mut st = self.state.lock();
        let identity = entry.identity;
        let addr = entry.addr;
        if !st.add(entry) {
            return false;
        }
        tracing::info!(
            "[popnode] added {} at {}, {} entries",
            identity,
            addr,
            st.len()
        );
        true
    }

    pub fn has(&self, identity: &NodeIdentity) -> bool {
        self.state.lock().find(identity).is_some()
    }

    pub fn get(&self, identity: &NodeIdentity) -> Option<NodeEntry> {
        self.state.lock().find(identity).cloned()
    }

    pub fn get_by_node_key(&self, key: &PublicKey) -> Option<NodeEntry> {
        self.state.lock().find_by_node_key(key).cloned()
    }

    pub fn get_by_payee(&self, payee: &PayeeScript) -> Option<NodeEntry> {
        self.state.lock().find_by_payee(payee).cloned()
    }

    /// Every entry, after a non-forced check.
    pub fn full_list(&self) -> Vec<NodeEntry> {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_all_locked(&mut st, now, false);
        st.entries().to_vec()
    }

    pub fn size(&self) -> usize {
        self.state.lock().len()
    }

    /// Enabled entries at or above `min_protocol`; `None` counts any version.
    pub fn count_enabled(&self, min_protocol: Option<u32>) -> usize {
        self.enabled_entries(min_protocol).len()
    }

    pub(crate) fn enabled_entries(&self, min_protocol: Option<u32>) -> Vec<NodeEntry> {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_all_locked(&mut st, now, false);
        st.entries()
            .iter()
            .filter(|e| e.is_enabled())
            .filter(|e| min_protocol.map_or(true, |floor| e.protocol_version >= floor))
            .cloned()
            .collect()
    }

    /// Uniformly random enabled entry not in `exclude` and meeting `min_protocol`.
    pub fn find_random_excluding(
        &self,
        exclude: &[NodeIdentity],
        min_protocol: Option<u32>,
    ) -> Option<NodeEntry> {
        let candidates: Vec<NodeEntry> = self
            .enabled_entries(min_protocol)
            .into_iter()
            .filter(|e| !exclude.contains(&e.identity))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(candidates.len() as u64) as usize;
        candidates.into_iter().nth(pick)
    }

    pub fn state_of(&self, identity: &NodeIdentity) -> Option<PopnodeState> {
        self.state.lock().find(identity).map(|e| e.state)
    }

    /// True if the entry's last ping was signed within `seconds` of `at`
    /// (now when `None`).
    pub fn is_pinged_within(
        &self,
        identity: &NodeIdentity,
        seconds: i64,
        at: Option<Timestamp>,
    ) -> bool {
        let at = at.unwrap_or_else(|| self.now());
        self.state
            .lock()
            .find(identity)
            .is_some_and(|e| e.is_pinged_within(seconds, at))
    }

    /// Install `ping` as the entry's last ping without gossip checks.
    pub fn set_last_ping(&self, ping: Ping) -> bool {
        let mut st = self.state.lock();
        let Some(entry) = st.find_mut(&ping.identity) else {
            return false;
        };
        entry.last_ping = Some(ping.clone());
        let mnb_hash = Announcement::from_entry(entry).hash();
        st.seen.record_ping(&ping);
        st.seen.refresh_announcement_ping(&mnb_hash, &ping);
        true
    }

    pub fn check_entry(&self, identity: &NodeIdentity, force: bool) -> Option<PopnodeState> {
        let now = self.now();
        let mut st = self.state.lock();
        let ctx = self.check_context(&st, now);
        let entry = st.find_mut(identity)?;
        self.check_entry_at(entry, &ctx, force);
        Some(entry.state)
    }

    pub fn check_all(&self, force: bool) {
        let now = self.now();
        let mut st = self.state.lock();
        self.check_all_locked(&mut st, now, force);
    }

    /// Drop every entry and table. The chain tip is kept.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    // =========================================================================
    // Ranking
    // =========================================================================

    pub fn rank_all(&self, height: BlockHeight, min_protocol: Option<u32>) -> Vec<(usize, NodeEntry)> {
        let now = self.now();
        let mut st = self.state.lock();
        self.ranks_locked(&mut st, height, min_protocol, now)
    }

    pub fn rank_of(
        &self,
        identity: &NodeIdentity,
        height: BlockHeight,
        min_protocol: Option<u32>,
    ) -> Option<usize> {
        self.rank_all(height, min_protocol)
            .into_iter()
            .find(|(_, e)| &e.identity == identity)
            .map(|(rank, _)| rank)
    }

    pub fn by_rank(
        &self,
        rank: usize,
        height: BlockHeight,
        min_protocol: Option<u32>,
    ) -> Option<NodeEntry> {
        self.rank_all(height, min_protocol)
            .into_iter()
            .find(|(r, _)| *r == rank)
            .map(|(_, e)| e)
    }

    // =========================================================================
    // Identity index
    // =========================================================================

    pub fn index_of(&self, identity: &NodeIdentity) -> Option<u32> {
        self.state.lock().index.index_of(identity)
    }

    pub fn identity_at(&self, index: u32) -> Option<NodeIdentity> {
        self.state.lock().index.get(index)
    }

    pub fn index_of_old(&self, identity: &NodeIdentity) -> Option<u32> {
        self.state.lock().index_old.index_of(identity)
    }

    pub fn identity_at_old(&self, index: u32) -> Option<NodeIdentity> {
        self.state.lock().index_old.get(index)
    }

    pub fn index_size(&self) -> usize {
        self.state.lock().index.size()
    }

    pub fn is_index_rebuilt(&self) -> bool {
        self.state.lock().index_rebuilt
    }

    /// Forget the pre-rebuild index once consumers have migrated.
    pub fn clear_old_index(&self) {
        let mut st = self.state.lock();
        st.index_old.clear();
        st.index_rebuilt = false;
    }

    // =========================================================================
    // Watchdog and mixing counters
    // =========================================================================

    pub fn update_watchdog_vote_time(&self, identity: &NodeIdentity) -> bool {
        let now = self.now();
        let mut st = self.state.lock();
        let Some(entry) = st.find_mut(identity) else {
            return false;
        };
        entry.last_watchdog_vote = now;
        st.last_watchdog_vote = now;
        true
    }

    pub fn is_watchdog_active(&self) -> bool {
        let now = self.now();
        now - self.state.lock().last_watchdog_vote <= self.config.watchdog_max_secs
    }

    /// Advance the mixing queue counter and stamp it on the entry.
    pub fn next_dsq_count(&self, identity: &NodeIdentity) -> Option<i64> {
        let mut st = self.state.lock();
        st.position(identity)?;
        st.dsq_count += 1;
        let count = st.dsq_count;
        if let Some(entry) = st.find_mut(identity) {
            entry.last_dsq = count;
        }
        Some(count)
    }

    pub fn tip(&self) -> Option<BlockHeight> {
        self.state.lock().tip_height()
    }

    /// One-line summary of the registry tables.
    pub fn summary(&self) -> String {
        self.state.lock().to_string()
    }
}
