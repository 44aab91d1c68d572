use std::sync::Arc;

use crate::domain::{
    calculate_score, Announcement, GossipMessage, Inventory, NodeEntry, OutboundAction,
    PopnodeState, RecoveryStatus, RegistryConfig, RejectReason, Signature, Verification,
    VerificationStatus, SERIALIZATION_VERSION,
};
use crate::ports::{CollateralVerdict, PopnodeRegistryApi};
use crate::service::LoadStatus;
use crate::test_utils::{
    addr, block_hash_at, init_test_logging, DigestSigner, MemorySnapshotStore, RecordingListener,
    TestNode, TestRegistry,
};

fn harness() -> TestRegistry {
    init_test_logging();
    TestRegistry::new(RegistryConfig::default())
}

fn reason(outcome: &crate::domain::DispatchOutcome) -> Option<RejectReason> {
    outcome.rejection.map(|r| r.reason)
}

fn sent_verify_requests(actions: &[OutboundAction]) -> Vec<(std::net::SocketAddr, Verification)> {
    actions
        .iter()
        .filter_map(|a| match a {
            OutboundAction::Send {
                peer,
                message: GossipMessage::VerifyRequest(v),
            } => Some((*peer, v.clone())),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Announcements
// =============================================================================

#[test]
fn test_announcement_adds_entry_and_relays() {
    let h = harness();
    let node = TestNode::new(1);
    let mnb = node.enabled_announcement(h.now(), 100);

    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(mnb.clone()));

    assert_eq!(
        outcome.actions,
        vec![OutboundAction::Relay(Inventory::announcement(mnb.hash()))]
    );
    assert!(h.registry.has(&node.identity));
    assert_eq!(h.registry.state_of(&node.identity), Some(PopnodeState::PreEnabled));
    assert_eq!(h.registry.count_enabled(None), 1);
    assert_eq!(h.registry.state_of(&node.identity), Some(PopnodeState::Enabled));
    assert_eq!(h.registry.index_of(&node.identity), Some(0));
}

#[test]
fn test_seen_announcement_is_not_processed_twice() {
    let h = harness();
    let mnb = TestNode::new(1).enabled_announcement(h.now(), 100);
    h.registry
        .process_message(addr(250), GossipMessage::Announce(mnb.clone()));

    let again = h
        .registry
        .process_message(addr(251), GossipMessage::Announce(mnb));
    assert!(again.actions.is_empty());
    assert!(!again.is_rejected());
    assert_eq!(h.registry.size(), 1);
}

#[test]
fn test_bad_collateral_signature_is_punished() {
    let h = harness();
    let mut mnb = TestNode::new(1).enabled_announcement(h.now(), 100);
    mnb.signature = Signature(vec![1u8; 32]);

    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(mnb));
    assert_eq!(reason(&outcome), Some(RejectReason::InvalidSignature));
    assert_eq!(outcome.misbehavior(), 100);
    assert_eq!(h.registry.size(), 0);
}

#[test]
fn test_forged_announcement_does_not_shadow_genuine_one() {
    let h = harness();
    let node = TestNode::new(1);
    let genuine = node.enabled_announcement(h.now(), 100);
    let mut forged = genuine.clone();
    forged.signature = Signature(vec![1u8; 32]);
    assert_eq!(forged.hash(), genuine.hash());

    let outcome = h
        .registry
        .process_message(addr(66), GossipMessage::Announce(forged));
    assert_eq!(reason(&outcome), Some(RejectReason::InvalidSignature));

    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(genuine.clone()));
    assert_eq!(
        outcome.actions,
        vec![OutboundAction::Relay(Inventory::announcement(genuine.hash()))]
    );
    assert!(h.registry.has(&node.identity));
}

#[test]
fn test_future_announcement_is_rejected() {
    let h = harness();
    let node = TestNode::new(1);
    let mnb = node.announcement(h.now() + 7_200, None);
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(mnb));
    assert_eq!(reason(&outcome), Some(RejectReason::FutureSignatureTime));
    assert_eq!(outcome.misbehavior(), 1);
}

#[test]
fn test_unconfirmed_collateral_is_evaluated_again_later() {
    let h = harness();
    let node = TestNode::new(1);
    let mnb = node.enabled_announcement(h.now(), 100);

    h.collateral
        .set_verdict(node.identity, CollateralVerdict::NotYetConfirmed);
    let first = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(mnb.clone()));
    assert_eq!(reason(&first), Some(RejectReason::CollateralNotConfirmed));
    assert_eq!(first.misbehavior(), 0);

    h.collateral.set_verdict(node.identity, CollateralVerdict::Valid);
    let second = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(mnb));
    assert!(!second.is_rejected());
    assert!(h.registry.has(&node.identity));
}

#[test]
fn test_old_protocol_starts_update_required() {
    let h = harness();
    let node = TestNode::new(1).with_protocol(70_000);
    h.registry.process_message(
        addr(250),
        GossipMessage::Announce(node.enabled_announcement(h.now(), 100)),
    );
    assert_eq!(
        h.registry.state_of(&node.identity),
        Some(PopnodeState::UpdateRequired)
    );
    assert_eq!(h.registry.count_enabled(None), 0);
}

#[test]
fn test_gossip_is_ignored_until_chain_synced() {
    let h = harness();
    h.chain.set_blockchain_synced(false);
    let outcome = h.registry.process_message(
        addr(250),
        GossipMessage::Announce(TestNode::new(1).enabled_announcement(h.now(), 100)),
    );
    assert!(outcome.actions.is_empty());
    assert!(!outcome.is_rejected());
    assert_eq!(h.registry.size(), 0);
}

#[test]
fn test_newer_announcement_updates_entry() {
    let h = harness();
    let node = TestNode::new(1);
    let first = node.enabled_announcement(h.now(), 100);
    h.registry
        .process_message(addr(250), GossipMessage::Announce(first.clone()));

    h.clock.advance(600);
    let t1 = h.now();
    let second = node.announcement(t1 - 100, Some(node.ping(block_hash_at(100), t1)));
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(second.clone()));

    assert!(outcome
        .actions
        .contains(&OutboundAction::Relay(Inventory::announcement(second.hash()))));
    let entry = h.registry.get(&node.identity).unwrap();
    assert_eq!(entry.sig_time, t1 - 100);
    assert_eq!(entry.last_ping_time(), t1);
    assert_eq!(entry.state, PopnodeState::PreEnabled);
    assert!(h
        .registry
        .lookup_inventory(&Inventory::announcement(first.hash()))
        .is_none());
}

#[test]
fn test_stale_and_foreign_key_announcements() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);

    let stale = node.announcement(h.now() - 5_000, None);
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(stale));
    assert_eq!(reason(&outcome), Some(RejectReason::StaleAnnouncement));
    assert_eq!(outcome.misbehavior(), 0);

    let mut thief = node.clone();
    thief.collateral = DigestSigner::new(77);
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Announce(thief.announcement(h.now(), None)));
    assert_eq!(reason(&outcome), Some(RejectReason::CollateralKeyMismatch));
    assert_eq!(outcome.misbehavior(), 33);
}

// =============================================================================
// Pings
// =============================================================================

#[test]
fn test_ping_refreshes_entry_and_relays() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);

    h.clock.advance(700);
    let ping = node.ping(block_hash_at(100), h.now());
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Ping(ping.clone()));

    assert_eq!(
        outcome.actions,
        vec![OutboundAction::Relay(Inventory::ping(ping.hash()))]
    );
    assert!(h.registry.is_pinged_within(&node.identity, 10, None));
    assert_eq!(
        h.registry.lookup_inventory(&Inventory::ping(ping.hash())),
        Some(GossipMessage::Ping(ping))
    );
}

#[test]
fn test_early_and_badly_signed_pings() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);

    let early = node.ping(block_hash_at(100), h.now() + 100);
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Ping(early));
    assert_eq!(reason(&outcome), Some(RejectReason::PingTooEarly));

    h.clock.advance(700);
    let mut forged = node.ping(block_hash_at(100), h.now());
    forged.signature = Signature(vec![9u8; 32]);
    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Ping(forged));
    assert_eq!(reason(&outcome), Some(RejectReason::InvalidSignature));
    assert_eq!(outcome.misbehavior(), 33);
}

#[test]
fn test_forged_ping_does_not_shadow_genuine_one() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    h.clock.advance(700);

    let genuine = node.ping(block_hash_at(100), h.now());
    let mut forged = genuine.clone();
    forged.signature = Signature(vec![9u8; 32]);
    assert_eq!(forged.hash(), genuine.hash());

    let outcome = h
        .registry
        .process_message(addr(66), GossipMessage::Ping(forged));
    assert_eq!(reason(&outcome), Some(RejectReason::InvalidSignature));
    assert!(!h.registry.is_pinged_within(&node.identity, 10, None));

    let outcome = h
        .registry
        .process_message(addr(250), GossipMessage::Ping(genuine.clone()));
    assert_eq!(
        outcome.actions,
        vec![OutboundAction::Relay(Inventory::ping(genuine.hash()))]
    );
    assert!(h.registry.is_pinged_within(&node.identity, 10, None));
}

#[test]
fn test_ping_on_old_block_is_dropped() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    h.clock.advance(700);

    let ping = node.ping(block_hash_at(50), h.now());
    let outcome = h.registry.process_message(addr(250), GossipMessage::Ping(ping));
    assert_eq!(reason(&outcome), Some(RejectReason::PingBlockTooOld));
}

#[test]
fn test_ping_for_unknown_entry_asks_sender_once() {
    let h = harness();
    let node = TestNode::new(1);
    let peer = addr(50);

    let outcome = h.registry.process_message(
        peer,
        GossipMessage::Ping(node.ping(block_hash_at(100), h.now())),
    );
    assert_eq!(
        outcome.actions,
        vec![OutboundAction::Send {
            peer,
            message: GossipMessage::ListRequest(Some(node.identity)),
        }]
    );

    let again = h.registry.process_message(
        peer,
        GossipMessage::Ping(node.ping(block_hash_at(100), h.now() + 1)),
    );
    assert!(again.actions.is_empty());
}

// =============================================================================
// List requests
// =============================================================================

#[test]
fn test_full_list_request_is_served_then_throttled() {
    let h = harness();
    for n in 1..=2u8 {
        h.announce_enabled(&TestNode::new(n));
    }
    let peer = addr(60);

    let outcome = h
        .registry
        .process_message(peer, GossipMessage::ListRequest(None));
    let pushes = outcome
        .actions
        .iter()
        .filter(|a| matches!(a, OutboundAction::PushInventory { .. }))
        .count();
    assert_eq!(pushes, 4);
    assert_eq!(
        outcome.actions.last(),
        Some(&OutboundAction::SyncCount { peer, count: 2 })
    );

    let again = h
        .registry
        .process_message(peer, GossipMessage::ListRequest(None));
    assert!(again.actions.is_empty());
    assert!(!again.is_rejected());
}

#[test]
fn test_local_peers_are_not_throttled() {
    let h = harness();
    h.announce_enabled(&TestNode::new(1));
    let local = "127.0.0.1:9888".parse().unwrap();
    for _ in 0..2 {
        let outcome = h
            .registry
            .process_message(local, GossipMessage::ListRequest(None));
        assert!(outcome
            .actions
            .contains(&OutboundAction::SyncCount { peer: local, count: 1 }));
    }
}

#[test]
fn test_single_entry_request_has_no_sync_count() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    h.announce_enabled(&TestNode::new(2));

    let outcome = h
        .registry
        .process_message(addr(60), GossipMessage::ListRequest(Some(node.identity)));
    assert_eq!(outcome.actions.len(), 2);
    assert!(outcome
        .actions
        .iter()
        .all(|a| matches!(a, OutboundAction::PushInventory { .. })));
}

#[test]
fn test_outbound_list_ask_is_throttled() {
    let h = harness();
    assert!(h.registry.dseg_update(addr(70)).is_some());
    assert!(h.registry.dseg_update(addr(70)).is_none());
    let local = "10.0.0.5:9888".parse().unwrap();
    assert!(h.registry.dseg_update(local).is_some());
    assert!(h.registry.dseg_update(local).is_some());
}

// =============================================================================
// Queries and ranking
// =============================================================================

#[test]
fn test_count_enabled_and_random_pick() {
    let h = harness();
    h.announce_enabled(&TestNode::new(1));
    h.announce_enabled(&TestNode::new(2));
    h.announce_enabled(&TestNode::new(3).with_protocol(70_100));

    assert_eq!(h.registry.count_enabled(None), 3);
    assert_eq!(h.registry.count_enabled(Some(70_206)), 2);

    let exclude = [TestNode::new(1).identity];
    for value in 0..4 {
        h.rng.set(value);
        let pick = h.registry.find_random_excluding(&exclude, None).unwrap();
        assert_ne!(pick.identity, exclude[0]);
    }
    let all: Vec<_> = (1..=3u8).map(|n| TestNode::new(n).identity).collect();
    assert!(h.registry.find_random_excluding(&all, None).is_none());
}

#[test]
fn test_random_pick_honours_protocol_floor() {
    let h = harness();
    let a = TestNode::new(1).with_protocol(70_203);
    let b = TestNode::new(2).with_protocol(70_100);
    let c = TestNode::new(3).with_protocol(70_203);
    for node in [&a, &b, &c] {
        h.announce_enabled(node);
    }

    for value in 0..6 {
        h.rng.set(value);
        let pick = h
            .registry
            .find_random_excluding(&[a.identity], Some(70_203))
            .unwrap();
        assert_eq!(pick.identity, c.identity);
    }
}

#[test]
fn test_ranking_is_deterministic_and_dense() {
    let h = harness();
    for n in 1..=5u8 {
        h.announce_enabled(&TestNode::new(n));
    }

    let ranks = h.registry.rank_all(100, None);
    assert_eq!(ranks.len(), 5);
    assert_eq!(
        ranks.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(ranks, h.registry.rank_all(100, None));

    let block = block_hash_at(100);
    for pair in ranks.windows(2) {
        assert!(
            calculate_score(&pair[0].1.identity, &block)
                <= calculate_score(&pair[1].1.identity, &block)
        );
    }
    for (rank, entry) in &ranks {
        assert_eq!(h.registry.rank_of(&entry.identity, 100, None), Some(*rank));
        assert_eq!(
            h.registry.by_rank(*rank, 100, None).map(|e| e.identity),
            Some(entry.identity)
        );
    }

    assert!(h.registry.rank_all(500, None).is_empty());
    assert_eq!(h.registry.rank_at(100, None), ranks);
}

#[test]
fn test_lookups_by_key_and_payee() {
    let h = harness();
    let node = TestNode::new(4);
    h.announce_enabled(&node);
    let entry = h.registry.get(&node.identity).unwrap();

    assert_eq!(
        h.registry.get_by_node_key(&entry.node_key).map(|e| e.identity),
        Some(node.identity)
    );
    assert_eq!(
        h.registry.get_by_payee(&entry.payee()).map(|e| e.identity),
        Some(node.identity)
    );
    assert_eq!(h.registry.full_list().len(), 1);
    assert_eq!(h.registry.enumerate_enabled(None).len(), 1);
}

#[test]
fn test_last_paid_follows_chain_payments() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    let payee = h.registry.get(&node.identity).unwrap().payee();

    h.chain.set_payee(95, payee);
    h.advance_tip(101);

    let entry = h.registry.get(&node.identity).unwrap();
    assert_eq!(entry.last_paid_block, 95);
    assert_eq!(entry.last_paid_time, crate::test_utils::START_TIME - 6 * 150);
}

#[test]
fn test_watchdog_and_mixing_counters() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);

    assert!(!h.registry.is_watchdog_active());
    assert!(h.registry.update_watchdog_vote_time(&node.identity));
    assert!(h.registry.is_watchdog_active());
    assert!(!h.registry.update_watchdog_vote_time(&TestNode::new(9).identity));

    assert_eq!(h.registry.next_dsq_count(&node.identity), Some(1));
    assert_eq!(h.registry.next_dsq_count(&node.identity), Some(2));
    assert_eq!(h.registry.get(&node.identity).unwrap().last_dsq, 2);
    assert_eq!(h.registry.next_dsq_count(&TestNode::new(9).identity), None);
}

// =============================================================================
// Sweep, removal, index rebuild
// =============================================================================

#[test]
fn test_spent_entries_are_removed_and_listeners_told() {
    let h = harness();
    let a = TestNode::new(1);
    let b = TestNode::new(2);
    h.announce_enabled(&a);
    h.announce_enabled(&b);
    h.registry.notify_updates();

    let listener = Arc::new(RecordingListener::new());
    h.registry.add_listener(listener.clone());
    h.collateral.spend(a.identity);
    h.registry.check_and_remove();

    assert!(!h.registry.has(&a.identity));
    assert!(h.registry.has(&b.identity));
    assert_eq!(listener.calls(), vec![(false, true)]);

    h.registry.check_and_remove();
    assert_eq!(listener.calls().len(), 1);
}

#[test]
fn test_new_start_required_entry_is_kept_for_the_grace_period() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    let config = RegistryConfig::default();

    h.clock.advance(config.new_start_required_secs + 1);
    assert_eq!(
        h.registry.check_entry(&node.identity, true),
        Some(PopnodeState::NewStartRequired)
    );
    h.registry.check_and_remove();
    assert!(h.registry.has(&node.identity));

    h.clock.advance(config.new_start_removal_grace_secs);
    h.registry.check_and_remove();
    assert!(!h.registry.has(&node.identity));
}

#[test]
fn test_sweep_is_skipped_before_list_sync() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    h.collateral.spend(node.identity);
    h.chain.set_list_synced(false);

    h.registry.check_and_remove();
    assert!(h.registry.has(&node.identity));
}

#[test]
fn test_sweep_drops_orphaned_seen_announcements() {
    let h = harness();
    let node = TestNode::new(1);
    h.announce_enabled(&node);
    let live = Announcement::from_entry(&h.registry.get(&node.identity).unwrap()).hash();
    let orphan = TestNode::new(2).enabled_announcement(h.now(), 100);
    h.registry
        .state
        .lock()
        .seen
        .record_announcement(orphan.hash(), h.now(), orphan.clone());

    h.registry.check_and_remove();
    assert!(h.registry.lookup_inventory(&Inventory::announcement(orphan.hash())).is_some());

    h.clock.advance(3 * 3_600 + 1);
    h.registry.check_and_remove();
    assert!(h.registry.lookup_inventory(&Inventory::announcement(orphan.hash())).is_none());
    assert!(h.registry.lookup_inventory(&Inventory::announcement(live)).is_some());
}

#[test]
fn test_index_rebuild_is_throttled() {
    let h = TestRegistry::new(RegistryConfig::for_testing());
    let nodes: Vec<TestNode> = (1..=6u8).map(TestNode::new).collect();
    for node in &nodes {
        h.announce_enabled(node);
    }
    for node in &nodes[..3] {
        h.collateral.spend(node.identity);
    }

    h.registry.check_and_remove();
    assert_eq!(h.registry.index_size(), 3);
    assert!(h.registry.is_index_rebuilt());
    assert!(h.registry.index_of_old(&nodes[0].identity).is_some());
    assert!(h.registry.index_of(&nodes[0].identity).is_none());
    let first = h.registry.index_of(&nodes[3].identity).unwrap();
    assert_eq!(h.registry.identity_at(first), Some(nodes[3].identity));

    h.registry.clear_old_index();
    assert!(!h.registry.is_index_rebuilt());
    assert!(h.registry.index_of_old(&nodes[0].identity).is_none());

    // Past the check interval so the survivors are re-checked.
    h.clock.advance(5);
    for n in 7..=9u8 {
        h.announce_enabled(&TestNode::new(n));
    }
    h.collateral.spend(nodes[3].identity);
    h.collateral.spend(nodes[4].identity);
    h.registry.check_and_remove();
    assert!(!h.registry.has(&nodes[3].identity));
    assert_eq!(h.registry.index_size(), 6);
    assert!(!h.registry.check_and_rebuild_index());

    h.clock.advance(55);
    assert!(h.registry.check_and_rebuild_index());
    assert_eq!(h.registry.index_size(), 4);
}

// =============================================================================
// Recovery
// =============================================================================

struct RecoverySetup {
    h: TestRegistry,
    stuck: TestNode,
    stale_sig_time: i64,
    hash: [u8; 32],
}

fn recovery_setup() -> RecoverySetup {
    let h = harness();
    for n in 2..=11u8 {
        h.announce_enabled(&TestNode::new(n));
    }
    let stuck = TestNode::new(1);
    let stale_sig_time = h.now() - 5 * 3_600;
    let stale = stuck.announcement(
        stale_sig_time,
        Some(stuck.ping(block_hash_at(100), h.now() - 4 * 3_600)),
    );
    let hash = stale.hash();
    h.registry
        .process_message(addr(250), GossipMessage::Announce(stale));
    assert_eq!(
        h.registry.check_entry(&stuck.identity, true),
        Some(PopnodeState::NewStartRequired)
    );

    h.registry.check_and_remove();
    let request = h.registry.recovery_request(&hash).unwrap();
    assert_eq!(request.status, RecoveryStatus::Pending);
    assert_eq!(request.asked.len(), 10);

    RecoverySetup {
        h,
        stuck,
        stale_sig_time,
        hash,
    }
}

impl RecoverySetup {
    fn fresh(&self) -> Announcement {
        self.stuck.announcement(
            self.stale_sig_time,
            Some(self.stuck.ping(block_hash_at(100), self.h.now())),
        )
    }

    fn reply_from(&self, n: u8) -> crate::domain::DispatchOutcome {
        self.h
            .registry
            .process_message(addr(n), GossipMessage::Announce(self.fresh()))
    }
}

#[test]
fn test_recovery_applies_quorum_of_six() {
    let s = recovery_setup();

    for n in 2..=6u8 {
        s.reply_from(n);
    }
    assert_eq!(s.h.registry.recovery_reply_count(&s.hash), 5);
    assert_eq!(
        s.h.registry.state_of(&s.stuck.identity),
        Some(PopnodeState::NewStartRequired)
    );

    let outcome = s.reply_from(7);
    assert!(outcome
        .actions
        .contains(&OutboundAction::Relay(Inventory::announcement(s.hash))));
    assert_eq!(
        s.h.registry.state_of(&s.stuck.identity),
        Some(PopnodeState::Enabled)
    );
    assert_eq!(
        s.h.registry.recovery_request(&s.hash).unwrap().status,
        RecoveryStatus::Resolved
    );

    assert!(s.reply_from(8).actions.is_empty());
}

#[test]
fn test_recovery_ignores_unasked_and_repeated_peers() {
    let s = recovery_setup();
    s.reply_from(2);
    s.reply_from(2);
    s.reply_from(200);
    assert_eq!(s.h.registry.recovery_reply_count(&s.hash), 1);
}

#[test]
fn test_recovery_without_quorum_is_abandoned_and_not_retried_early() {
    let s = recovery_setup();
    let requested_at = s.h.registry.recovery_request(&s.hash).unwrap().requested_at;
    for n in 2..=6u8 {
        s.reply_from(n);
    }

    s.h.clock.advance(61);
    s.h.registry.check_and_remove();
    assert_eq!(
        s.h.registry.recovery_request(&s.hash).unwrap().status,
        RecoveryStatus::Abandoned
    );
    assert_eq!(
        s.h.registry.state_of(&s.stuck.identity),
        Some(PopnodeState::NewStartRequired)
    );

    s.h.clock.set(requested_at + 3 * 3_600 - 1);
    s.h.registry.check_and_remove();
    let request = s.h.registry.recovery_request(&s.hash).unwrap();
    assert_eq!(request.requested_at, requested_at);
    assert_eq!(request.status, RecoveryStatus::Abandoned);

    s.h.clock.set(requested_at + 3 * 3_600 + 1);
    s.h.registry.check_and_remove();
    assert!(!s.h.registry.is_recovery_requested(&s.hash));
    s.h.registry.check_and_remove();
    let reopened = s.h.registry.recovery_request(&s.hash).unwrap();
    assert_eq!(reopened.requested_at, requested_at + 3 * 3_600 + 1);
    assert_eq!(reopened.status, RecoveryStatus::Pending);
}

#[test]
fn test_recovery_waits_for_peers_to_ask() {
    let h = harness();
    let stuck = TestNode::new(1);
    let stale = stuck.announcement(
        h.now() - 5 * 3_600,
        Some(stuck.ping(block_hash_at(100), h.now() - 4 * 3_600)),
    );
    let hash = stale.hash();
    h.registry
        .process_message(addr(250), GossipMessage::Announce(stale));
    assert_eq!(
        h.registry.check_entry(&stuck.identity, true),
        Some(PopnodeState::NewStartRequired)
    );

    h.registry.check_and_remove();
    assert!(h.registry.recovery_request(&hash).is_none());

    for n in 2..=11u8 {
        h.announce_enabled(&TestNode::new(n));
    }
    h.registry.check_and_remove();
    let request = h.registry.recovery_request(&hash).unwrap();
    assert_eq!(request.status, RecoveryStatus::Pending);
    assert_eq!(request.asked.len(), 10);
}

#[test]
fn test_recovery_connections_are_scheduled() {
    let s = recovery_setup();
    let mut peers = Vec::new();
    while let Some((peer, hashes)) = s.h.registry.pop_scheduled_connection() {
        assert!(hashes.contains(&s.hash));
        peers.push(peer);
    }
    assert_eq!(peers.len(), 10);
    assert!(!peers.contains(&addr(1)));
}

// =============================================================================
// Verification
// =============================================================================

#[test]
fn test_challenge_is_answered_once_per_window() {
    let local = TestNode::new(1);
    let h = TestRegistry::with_local(RegistryConfig::default(), &local);
    let peer = addr(2);

    let request = Verification::request(local.addr, 7, 99);
    let outcome = h
        .registry
        .process_message(peer, GossipMessage::VerifyRequest(request.clone()));
    let expected = local
        .node
        .sign_bytes(&Verification::reply_message(&local.addr, 7, &block_hash_at(99)));
    match outcome.actions.as_slice() {
        [OutboundAction::Send {
            peer: to,
            message: GossipMessage::VerifyReply(reply),
        }] => {
            assert_eq!(*to, peer);
            assert_eq!(reply.sig1, expected);
            assert_eq!(reply.nonce, 7);
        }
        other => panic!("unexpected actions {:?}", other),
    }

    let again = h
        .registry
        .process_message(peer, GossipMessage::VerifyRequest(request));
    assert_eq!(reason(&again), Some(RejectReason::VerificationRepeated));
    assert_eq!(again.misbehavior(), 20);
}

#[test]
fn test_challenge_without_local_popnode_is_ignored() {
    let h = harness();
    let outcome = h.registry.process_message(
        addr(2),
        GossipMessage::VerifyRequest(Verification::request(addr(1), 7, 99)),
    );
    assert_eq!(outcome, crate::domain::DispatchOutcome::ignored());
}

#[test]
fn test_valid_reply_credits_signer_and_penalizes_impostor() {
    let local = TestNode::new(1);
    let h = TestRegistry::with_local(RegistryConfig::default(), &local);
    h.announce_enabled(&local);
    let target = TestNode::new(3);
    let impostor = TestNode::new(4).with_addr(target.addr);
    h.announce_enabled(&target);
    h.announce_enabled(&impostor);

    let action = h
        .registry
        .send_verify_request(target.addr, &[target.addr])
        .unwrap();
    let (_, challenge) = sent_verify_requests(&[action]).pop().unwrap();
    assert_eq!(challenge.block_height, 99);
    assert!(h.registry.confirm_verify_dispatch(&target.addr));
    assert!(h
        .registry
        .send_verify_request(target.addr, &[target.addr])
        .is_none());

    let mut reply = challenge.clone();
    reply.sig1 = target.node.sign_bytes(&Verification::reply_message(
        &target.addr,
        challenge.nonce,
        &block_hash_at(99),
    ));
    let outcome = h
        .registry
        .process_message(target.addr, GossipMessage::VerifyReply(reply.clone()));

    assert_eq!(outcome.actions.len(), 1);
    assert!(matches!(
        outcome.actions[0],
        OutboundAction::Relay(Inventory { kind: crate::domain::InventoryKind::Verification, .. })
    ));
    assert_eq!(h.registry.get(&target.identity).unwrap().pose_ban_score, -1);
    assert_eq!(h.registry.get(&impostor.identity).unwrap().pose_ban_score, 1);
    assert_eq!(
        h.registry.verification_status(&target.addr),
        VerificationStatus::Verified
    );

    let again = h
        .registry
        .process_message(target.addr, GossipMessage::VerifyReply(reply));
    assert_eq!(reason(&again), Some(RejectReason::AlreadyVerified));
}

#[test]
fn test_bad_replies_are_punished() {
    let local = TestNode::new(1);
    let h = TestRegistry::with_local(RegistryConfig::default(), &local);
    let target = TestNode::new(3);
    h.announce_enabled(&target);

    let unsolicited = h.registry.process_message(
        addr(9),
        GossipMessage::VerifyReply(Verification::request(addr(9), 1, 99)),
    );
    assert_eq!(reason(&unsolicited), Some(RejectReason::VerificationNotRequested));
    assert_eq!(unsolicited.misbehavior(), 20);

    let action = h
        .registry
        .send_verify_request(target.addr, &[target.addr])
        .unwrap();
    let (_, challenge) = sent_verify_requests(&[action]).pop().unwrap();
    let mut reply = challenge.clone();
    reply.nonce = challenge.nonce.wrapping_add(1);
    reply.sig1 = Signature(vec![1]);
    let outcome = h
        .registry
        .process_message(target.addr, GossipMessage::VerifyReply(reply));
    assert_eq!(reason(&outcome), Some(RejectReason::NonceMismatch));
    assert_eq!(
        h.registry.verification_status(&target.addr),
        VerificationStatus::Failed
    );
}

fn signed_challenge(h: &TestRegistry, target: &TestNode) -> Verification {
    let action = h
        .registry
        .send_verify_request(target.addr, &[target.addr])
        .unwrap();
    let (_, challenge) = sent_verify_requests(&[action]).pop().unwrap();
    let mut reply = challenge.clone();
    reply.sig1 = target.node.sign_bytes(&Verification::reply_message(
        &target.addr,
        challenge.nonce,
        &block_hash_at(challenge.block_height),
    ));
    reply
}

#[test]
fn test_late_reply_times_out_without_credit() {
    let local = TestNode::new(1);
    let h = TestRegistry::with_local(RegistryConfig::default(), &local);
    let target = TestNode::new(3);
    h.announce_enabled(&target);
    let reply = signed_challenge(&h, &target);

    h.clock.advance(2 * 3_600);
    let outcome = h
        .registry
        .process_message(target.addr, GossipMessage::VerifyReply(reply));
    assert_eq!(reason(&outcome), Some(RejectReason::VerificationExpired));
    assert_eq!(outcome.misbehavior(), 0);
    assert!(outcome.actions.is_empty());
    assert_eq!(
        h.registry.verification_status(&target.addr),
        VerificationStatus::TimedOut
    );
    assert_eq!(h.registry.get(&target.identity).unwrap().pose_ban_score, 0);
}

#[test]
fn test_reply_to_buried_challenge_times_out() {
    let local = TestNode::new(1);
    let h = TestRegistry::with_local(RegistryConfig::default(), &local);
    let target = TestNode::new(3);
    h.announce_enabled(&target);
    let reply = signed_challenge(&h, &target);
    assert_eq!(reply.block_height, 99);

    h.advance_tip(110);
    let outcome = h
        .registry
        .process_message(target.addr, GossipMessage::VerifyReply(reply));
    assert_eq!(reason(&outcome), Some(RejectReason::VerificationExpired));
    assert_eq!(
        h.registry.verification_status(&target.addr),
        VerificationStatus::TimedOut
    );
    assert_eq!(h.registry.get(&target.identity).unwrap().pose_ban_score, 0);
}

fn countersigned(
    verified: &TestNode,
    verifier: &TestNode,
    nonce: u32,
    height: u64,
) -> Verification {
    let block = block_hash_at(height);
    let mut v = Verification::request(verified.addr, nonce, height);
    v.identity1 = Some(verified.identity);
    v.identity2 = Some(verifier.identity);
    v.sig1 = verified
        .node
        .sign_bytes(&Verification::reply_message(&verified.addr, nonce, &block));
    v.sig2 = verifier.node.sign_bytes(&Verification::broadcast_message(
        &verified.addr,
        nonce,
        &block,
        &verified.identity,
        &verifier.identity,
    ));
    v
}

#[test]
fn test_broadcast_credits_verified_entry_once() {
    let h = harness();
    let verifier = TestNode::new(2);
    let verified = TestNode::new(3);
    let impostor = TestNode::new(4).with_addr(verified.addr);
    for node in [&verifier, &verified, &impostor] {
        h.announce_enabled(node);
    }

    let broadcast = countersigned(&verified, &verifier, 9, 99);
    let outcome = h
        .registry
        .process_message(addr(50), GossipMessage::VerifyBroadcast(broadcast.clone()));
    assert_eq!(
        outcome.actions,
        vec![OutboundAction::Relay(Inventory::verification(broadcast.hash()))]
    );
    assert_eq!(h.registry.get(&verified.identity).unwrap().pose_ban_score, -1);
    assert_eq!(h.registry.get(&impostor.identity).unwrap().pose_ban_score, 1);
    assert_eq!(h.registry.get(&verifier.identity).unwrap().pose_ban_score, 0);

    let again = h
        .registry
        .process_message(addr(51), GossipMessage::VerifyBroadcast(broadcast));
    assert_eq!(again, crate::domain::DispatchOutcome::ignored());
    assert_eq!(h.registry.get(&verified.identity).unwrap().pose_ban_score, -1);
}

#[test]
fn test_broadcast_sanity_checks() {
    let h = harness();
    let verifier = TestNode::new(2);
    let verified = TestNode::new(3);
    h.announce_enabled(&verifier);
    h.announce_enabled(&verified);

    let twice = countersigned(&verified, &verified, 1, 99);
    let outcome = h
        .registry
        .process_message(addr(50), GossipMessage::VerifyBroadcast(twice));
    assert_eq!(reason(&outcome), Some(RejectReason::SameIdentities));
    assert_eq!(outcome.misbehavior(), 100);

    let mut forged = countersigned(&verified, &verifier, 2, 99);
    forged.sig2 = Signature(vec![3u8; 32]);
    let outcome = h
        .registry
        .process_message(addr(50), GossipMessage::VerifyBroadcast(forged));
    assert_eq!(reason(&outcome), Some(RejectReason::InvalidSignature));
    assert_eq!(outcome.misbehavior(), 0);

    let outdated = countersigned(&verified, &verifier, 3, 80);
    let outcome = h
        .registry
        .process_message(addr(50), GossipMessage::VerifyBroadcast(outdated));
    assert!(!outcome.is_rejected());
    assert!(outcome.actions.is_empty());
    assert_eq!(h.registry.get(&verified.identity).unwrap().pose_ban_score, 0);
}

#[test]
fn test_same_address_entries_are_penalized() {
    let h = harness();
    let config = RegistryConfig::default();
    let verified = TestNode::new(3);
    let duplicate = TestNode::new(4).with_addr(verified.addr);

    let mut entry = NodeEntry::from_announcement(&verified.enabled_announcement(h.now(), 100));
    entry.state = PopnodeState::Enabled;
    entry.pose_ban_score = config.pose_verified_score();
    let mut other = NodeEntry::from_announcement(&duplicate.enabled_announcement(h.now(), 100));
    other.state = PopnodeState::Enabled;
    assert!(h.registry.add(entry));
    assert!(h.registry.add(other));

    assert_eq!(h.registry.check_same_addr(), 1);
    assert_eq!(h.registry.get(&duplicate.identity).unwrap().pose_ban_score, 1);
    assert_eq!(
        h.registry.get(&verified.identity).unwrap().pose_ban_score,
        config.pose_verified_score()
    );
}

#[test]
fn test_later_verified_entry_at_shared_address_is_penalized() {
    let h = harness();
    let config = RegistryConfig::default();
    let first = TestNode::new(3);
    let second = TestNode::new(4).with_addr(first.addr);
    let unverified = TestNode::new(5).with_addr(first.addr);

    for (node, score) in [
        (&first, config.pose_verified_score()),
        (&second, config.pose_verified_score()),
        (&unverified, 0),
    ] {
        let mut entry = NodeEntry::from_announcement(&node.enabled_announcement(h.now(), 100));
        entry.state = PopnodeState::Enabled;
        entry.pose_ban_score = score;
        assert!(h.registry.add(entry));
    }

    assert_eq!(h.registry.check_same_addr(), 2);
    let score = |node: &TestNode| h.registry.get(&node.identity).unwrap().pose_ban_score;
    assert_eq!(score(&first), config.pose_verified_score());
    assert_eq!(score(&second), config.pose_verified_score() + 1);
    assert_eq!(score(&unverified), 1);
}

#[test]
fn test_verification_step_challenges_ranked_slice() {
    let nodes: Vec<TestNode> = (1..=25u8).map(TestNode::new).collect();

    let reference = harness();
    for node in &nodes {
        reference.announce_enabled(node);
    }
    let ranks = reference.registry.rank_all(99, Some(70_203));
    let top = ranks[0].1.identity;
    let local = nodes.iter().find(|n| n.identity == top).unwrap();

    let h = TestRegistry::with_local(RegistryConfig::default(), local);
    for node in &nodes {
        h.announce_enabled(node);
    }
    let actions = h.registry.do_full_verification_step();
    let targets: Vec<_> = sent_verify_requests(&actions)
        .into_iter()
        .map(|(peer, _)| peer)
        .collect();
    assert_eq!(targets, vec![ranks[10].1.addr, ranks[20].1.addr]);
    assert_eq!(h.registry.verification_status(&targets[0]), VerificationStatus::RequestSent);
    assert!(h.registry.do_full_verification_step().is_empty());
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_snapshot_restores_registry() {
    let h = harness();
    for n in 1..=3u8 {
        h.announce_enabled(&TestNode::new(n));
    }
    let store = MemorySnapshotStore::new();
    h.registry.save(&store).unwrap();

    let fresh = harness();
    assert_eq!(
        fresh.registry.load(&store).unwrap(),
        LoadStatus::Loaded { entries: 3 }
    );
    for n in 1..=3u8 {
        let id = TestNode::new(n).identity;
        assert_eq!(fresh.registry.get(&id), h.registry.get(&id));
        assert_eq!(fresh.registry.index_of(&id), h.registry.index_of(&id));
    }
    assert_eq!(fresh.registry.tip(), Some(100));
}

#[test]
fn test_missing_snapshot() {
    let h = harness();
    assert_eq!(
        h.registry.load(&MemorySnapshotStore::new()).unwrap(),
        LoadStatus::Missing
    );
}

#[test]
fn test_version_mismatch_resets_registry() {
    let h = harness();
    h.announce_enabled(&TestNode::new(1));
    let old = h
        .registry
        .encode_snapshot_with_version("PopnodeRegistry-Version-3")
        .unwrap();

    let status = h.registry.restore_from_bytes(&old).unwrap();
    assert_eq!(
        status,
        LoadStatus::Reset {
            found_version: "PopnodeRegistry-Version-3".to_string()
        }
    );
    assert_ne!(SERIALIZATION_VERSION, "PopnodeRegistry-Version-3");
    assert_eq!(h.registry.size(), 0);
    assert_eq!(h.registry.tip(), Some(100));
}

#[test]
fn test_corrupt_snapshot_leaves_registry_untouched() {
    let h = harness();
    h.announce_enabled(&TestNode::new(1));
    assert!(h.registry.restore_from_bytes(&[1, 2, 3]).is_err());
    assert_eq!(h.registry.size(), 1);
}

#[test]
fn test_api_change_flags() {
    let h = harness();
    assert_eq!(h.registry.change_flags(), (false, false));
    h.announce_enabled(&TestNode::new(1));
    assert_eq!(h.registry.change_flags(), (true, false));

    let listener = Arc::new(RecordingListener::new());
    h.registry.add_listener(listener.clone());
    h.registry.notify_updates();
    assert_eq!(listener.calls(), vec![(true, false)]);
    assert_eq!(h.registry.change_flags(), (false, false));
}
