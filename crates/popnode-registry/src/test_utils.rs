//! Test utilities for the popnode registry.
//!
//! Mock ports and fixtures for deterministic tests. Enable with the
//! `test-utils` feature flag.
//!
//! # Example
//!
//! ```rust
//! use popnode_registry::test_utils::ControllableTimeSource;
//! use popnode_registry::TimeSource;
//!
//! let clock = ControllableTimeSource::new(1_000);
//! clock.advance(60);
//! assert_eq!(clock.now(), 1_060);
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::domain::{
    double_sha256, Announcement, BlockHeight, GossipMessage, Hash, Inventory, NodeIdentity,
    OutboundAction, PayeeScript, Ping, PublicKey, RegistryConfig, Signature, Timestamp,
};
use crate::error::{PersistenceError, SignerError};
use crate::ports::{
    ChainView, CollateralLedger, CollateralVerdict, ConnectError, MembershipListener,
    MessageSigner, PeerConnector, PeerNetwork, RandomSource, SignatureVerifier, SnapshotStore,
    TimeSource,
};
use crate::service::{LocalPopnode, PopnodeRegistry, RegistryDeps};

/// Wall-clock start of every test scenario.
pub const START_TIME: Timestamp = 1_700_000_000;

/// Protocol version of the fixture nodes.
pub const TEST_PROTOCOL: u32 = 70_206;

// =============================================================================
// Clock and randomness
// =============================================================================

#[derive(Debug)]
pub struct ControllableTimeSource {
    now: AtomicI64,
}

impl ControllableTimeSource {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl TimeSource for ControllableTimeSource {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Always returns `value % upper`.
#[derive(Debug)]
pub struct FixedRandomSource {
    value: AtomicI64,
}

impl FixedRandomSource {
    pub fn new(value: u64) -> Self {
        Self {
            value: AtomicI64::new(value as i64),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value as i64, Ordering::SeqCst);
    }
}

impl RandomSource for FixedRandomSource {
    fn gen_range(&self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        (self.value.load(Ordering::SeqCst) as u64) % upper
    }
}

// =============================================================================
// Chain and collateral
// =============================================================================

/// Block hash of the mock chain at `height`.
pub fn block_hash_at(height: BlockHeight) -> Hash {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&height.to_le_bytes());
    hash[31] = 0xab;
    hash
}

#[derive(Debug)]
struct ChainState {
    tip: BlockHeight,
    blockchain_synced: bool,
    list_synced: bool,
    payees: HashMap<BlockHeight, PayeeScript>,
}

/// Linear chain `0..=tip` with 150-second blocks ending at [`START_TIME`].
#[derive(Debug)]
pub struct MockChain {
    state: RwLock<ChainState>,
}

impl MockChain {
    pub fn new(tip: BlockHeight) -> Self {
        Self {
            state: RwLock::new(ChainState {
                tip,
                blockchain_synced: true,
                list_synced: true,
                payees: HashMap::new(),
            }),
        }
    }

    pub fn tip(&self) -> BlockHeight {
        self.state.read().tip
    }

    pub fn set_tip(&self, tip: BlockHeight) {
        self.state.write().tip = tip;
    }

    pub fn set_blockchain_synced(&self, synced: bool) {
        self.state.write().blockchain_synced = synced;
    }

    pub fn set_list_synced(&self, synced: bool) {
        self.state.write().list_synced = synced;
    }

    pub fn set_payee(&self, height: BlockHeight, payee: PayeeScript) {
        self.state.write().payees.insert(height, payee);
    }
}

impl ChainView for MockChain {
    fn block_hash(&self, height: BlockHeight) -> Option<Hash> {
        (height <= self.state.read().tip).then(|| block_hash_at(height))
    }

    fn block_height(&self, hash: &Hash) -> Option<BlockHeight> {
        if hash[31] != 0xab || hash[8..31].iter().any(|b| *b != 0) {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash[..8]);
        let height = u64::from_le_bytes(bytes);
        (height <= self.state.read().tip).then_some(height)
    }

    fn block_time(&self, height: BlockHeight) -> Option<Timestamp> {
        let tip = self.state.read().tip;
        (height <= tip).then(|| START_TIME - (tip - height) as Timestamp * 150)
    }

    fn duty_payee(&self, height: BlockHeight) -> Option<PayeeScript> {
        self.state.read().payees.get(&height).cloned()
    }

    fn is_blockchain_synced(&self) -> bool {
        self.state.read().blockchain_synced
    }

    fn is_list_synced(&self) -> bool {
        self.state.read().list_synced
    }
}

/// Collateral rules: valid unless told otherwise.
#[derive(Debug, Default)]
pub struct MockCollateral {
    spent: RwLock<HashSet<NodeIdentity>>,
    verdicts: RwLock<HashMap<NodeIdentity, CollateralVerdict>>,
}

impl MockCollateral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spend(&self, identity: NodeIdentity) {
        self.spent.write().insert(identity);
    }

    pub fn set_verdict(&self, identity: NodeIdentity, verdict: CollateralVerdict) {
        self.verdicts.write().insert(identity, verdict);
    }
}

impl CollateralLedger for MockCollateral {
    fn verify_collateral(&self, announcement: &Announcement) -> CollateralVerdict {
        self.verdicts
            .read()
            .get(&announcement.identity)
            .copied()
            .unwrap_or(CollateralVerdict::Valid)
    }

    fn is_spent(&self, identity: &NodeIdentity) -> bool {
        self.spent.read().contains(identity)
    }
}

// =============================================================================
// Signatures
// =============================================================================

/// Signature = `double_sha256(public key ‖ message)`. Deterministic and
/// cheap; verified by [`DigestVerifier`].
#[derive(Debug, Clone)]
pub struct DigestSigner {
    public_key: PublicKey,
}

impl DigestSigner {
    /// Compressed-length key derived from `seed`.
    pub fn new(seed: u8) -> Self {
        let mut key = vec![0x02];
        key.extend_from_slice(&[seed; 32]);
        Self {
            public_key: PublicKey::new(key),
        }
    }

    pub fn sign_bytes(&self, message: &[u8]) -> Signature {
        digest_signature(&self.public_key, message)
    }
}

fn digest_signature(key: &PublicKey, message: &[u8]) -> Signature {
    let mut preimage = key.0.clone();
    preimage.extend_from_slice(message);
    Signature(double_sha256(&preimage).to_vec())
}

impl MessageSigner for DigestSigner {
    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, SignerError> {
        Ok(self.sign_bytes(message))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        digest_signature(key, message) == *signature
    }
}

// =============================================================================
// Session layer
// =============================================================================

/// Records every action handed to the network.
#[derive(Debug, Default)]
pub struct RecordingNetwork {
    actions: Mutex<Vec<OutboundAction>>,
    penalties: Mutex<Vec<(SocketAddr, u32)>>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<OutboundAction> {
        self.actions.lock().clone()
    }

    pub fn penalties(&self) -> Vec<(SocketAddr, u32)> {
        self.penalties.lock().clone()
    }

    pub fn relayed(&self) -> Vec<Inventory> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Relay(inv) => Some(*inv),
                _ => None,
            })
            .collect()
    }
}

impl PeerNetwork for RecordingNetwork {
    fn send(&self, peer: SocketAddr, message: GossipMessage) {
        self.actions
            .lock()
            .push(OutboundAction::Send { peer, message });
    }

    fn push_inventory(&self, peer: SocketAddr, inventory: Inventory) {
        self.actions
            .lock()
            .push(OutboundAction::PushInventory { peer, inventory });
    }

    fn request_data(&self, peer: SocketAddr, inventory: Vec<Inventory>) {
        self.actions
            .lock()
            .push(OutboundAction::RequestData { peer, inventory });
    }

    fn relay(&self, inventory: Inventory) {
        self.actions.lock().push(OutboundAction::Relay(inventory));
    }

    fn send_sync_count(&self, peer: SocketAddr, count: usize) {
        self.actions
            .lock()
            .push(OutboundAction::SyncCount { peer, count });
    }

    fn penalize(&self, peer: SocketAddr, score: u32) {
        self.penalties.lock().push((peer, score));
    }
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<(bool, bool)>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(bool, bool)> {
        self.calls.lock().clone()
    }
}

impl MembershipListener for RecordingListener {
    fn on_membership_changed(&self, added: bool, removed: bool) {
        self.calls.lock().push((added, removed));
    }
}

/// Records announcement requests; connections to `unreachable` fail.
#[derive(Debug, Default)]
pub struct RecordingConnector {
    requests: Mutex<Vec<(SocketAddr, Vec<Hash>)>>,
    unreachable: RwLock<HashSet<SocketAddr>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, addr: SocketAddr) {
        self.unreachable.write().insert(addr);
    }

    pub fn requests(&self) -> Vec<(SocketAddr, Vec<Hash>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PeerConnector for RecordingConnector {
    async fn request_announcements(
        &self,
        addr: SocketAddr,
        hashes: Vec<Hash>,
    ) -> Result<(), ConnectError> {
        if self.unreachable.read().contains(&addr) {
            return Err(ConnectError::Unreachable(addr));
        }
        self.requests.lock().push((addr, hashes));
        Ok(())
    }
}

/// Snapshot store kept in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn write(&self, payload: &[u8]) -> Result<(), PersistenceError> {
        *self.bytes.lock() = Some(payload.to_vec());
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.bytes.lock().clone())
    }
}

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn identity(n: u8) -> NodeIdentity {
    NodeIdentity::new([n; 32], 0)
}

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([203, 0, 113, n], 9888))
}

/// A popnode with deterministic keys.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub identity: NodeIdentity,
    pub addr: SocketAddr,
    pub collateral: DigestSigner,
    pub node: DigestSigner,
    pub protocol_version: u32,
}

impl TestNode {
    pub fn new(n: u8) -> Self {
        Self {
            identity: identity(n),
            addr: addr(n),
            collateral: DigestSigner::new(n),
            node: DigestSigner::new(n.wrapping_add(100)),
            protocol_version: TEST_PROTOCOL,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_protocol(mut self, protocol_version: u32) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn ping(&self, block_hash: Hash, sig_time: Timestamp) -> Ping {
        let mut ping = Ping::new(self.identity, block_hash, sig_time);
        ping.signature = self.node.sign_bytes(&ping.signing_message());
        ping
    }

    pub fn announcement(&self, sig_time: Timestamp, ping: Option<Ping>) -> Announcement {
        let mut announcement = Announcement {
            identity: self.identity,
            addr: self.addr,
            collateral_key: self.collateral.public_key(),
            node_key: self.node.public_key(),
            signature: Signature::default(),
            sig_time,
            protocol_version: self.protocol_version,
            last_ping: ping,
            recovery: false,
        };
        announcement.signature = self.collateral.sign_bytes(&announcement.signing_message());
        announcement
    }

    /// Announcement signed 1000s before `now` with a ping at `now` on
    /// block `ping_height`: enabled once checked.
    pub fn enabled_announcement(&self, now: Timestamp, ping_height: BlockHeight) -> Announcement {
        let ping = self.ping(block_hash_at(ping_height), now);
        self.announcement(now - 1_000, Some(ping))
    }

    pub fn local(&self) -> LocalPopnode {
        LocalPopnode {
            identity: self.identity,
            addr: self.addr,
            signer: Arc::new(self.node.clone()),
        }
    }
}

/// A registry wired to mocks, with handles to drive them.
pub struct TestRegistry {
    pub registry: Arc<PopnodeRegistry>,
    pub clock: Arc<ControllableTimeSource>,
    pub chain: Arc<MockChain>,
    pub collateral: Arc<MockCollateral>,
    pub rng: Arc<FixedRandomSource>,
}

impl TestRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_local(config: RegistryConfig, local: &TestNode) -> Self {
        Self::build(config, Some(local.local()))
    }

    fn build(config: RegistryConfig, local: Option<LocalPopnode>) -> Self {
        let clock = Arc::new(ControllableTimeSource::new(START_TIME));
        let chain = Arc::new(MockChain::new(100));
        let collateral = Arc::new(MockCollateral::new());
        let rng = Arc::new(FixedRandomSource::new(0));
        let deps = RegistryDeps {
            chain: chain.clone(),
            collateral: collateral.clone(),
            verifier: Arc::new(DigestVerifier),
            clock: clock.clone(),
            rng: rng.clone(),
        };
        let mut registry = PopnodeRegistry::new(config, deps);
        if let Some(local) = local {
            registry = registry.with_local_popnode(local);
        }
        let registry = Arc::new(registry);
        registry.ledger_tip_changed(chain.tip(), block_hash_at(chain.tip()));
        Self {
            registry,
            clock,
            chain,
            collateral,
            rng,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Move the chain tip and notify the registry.
    pub fn advance_tip(&self, height: BlockHeight) {
        self.chain.set_tip(height);
        self.registry.ledger_tip_changed(height, block_hash_at(height));
    }

    /// Accept an enabled announcement for `node` through gossip.
    pub fn announce_enabled(&self, node: &TestNode) {
        let tip = self.chain.tip();
        let outcome = self.registry.process_message(
            addr(250),
            GossipMessage::Announce(node.enabled_announcement(self.now(), tip)),
        );
        assert!(!outcome.is_rejected(), "announcement rejected: {:?}", outcome.rejection);
    }
}
