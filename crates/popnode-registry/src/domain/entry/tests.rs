use super::*;
use crate::domain::config::RegistryConfig;
use crate::domain::rejection::RejectReason;
use crate::domain::types::{NodeIdentity, PublicKey, Signature};

const T0: i64 = 1_700_000_000;

fn announcement(sig_time: i64, ping_time: Option<i64>) -> Announcement {
    let identity = NodeIdentity::new([7u8; 32], 1);
    Announcement {
        identity,
        addr: "203.0.113.5:9888".parse().unwrap(),
        collateral_key: PublicKey::new(vec![2u8; 33]),
        node_key: PublicKey::new(vec![3u8; 33]),
        signature: Signature(vec![1, 2, 3]),
        sig_time,
        protocol_version: 70_206,
        last_ping: ping_time.map(|t| Ping::new(identity, [9u8; 32], t)),
        recovery: false,
    }
}

fn ctx(now: i64) -> CheckContext {
    CheckContext {
        now,
        height: 100,
        list_synced: true,
        watchdog_active: false,
        registry_size: 10,
    }
}

#[test]
fn test_fresh_announcement_is_pre_enabled() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 60)));
    entry.check(&ctx(T0 + 120), false, &config);
    assert_eq!(entry.state, PopnodeState::PreEnabled);
}

#[test]
fn test_enabled_once_ping_is_past_min_interval() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 700)));
    entry.check(&ctx(T0 + 720), false, &config);
    assert_eq!(entry.state, PopnodeState::Enabled);
}

#[test]
fn test_expiry_ladder() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 700)));

    entry.check(&ctx(T0 + 700 + 66 * 60), false, &config);
    assert_eq!(entry.state, PopnodeState::Expired);

    entry.check(&ctx(T0 + 700 + 181 * 60), false, &config);
    assert_eq!(entry.state, PopnodeState::NewStartRequired);
}

#[test]
fn test_unsynced_list_does_not_demote() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 700)));
    entry.state = PopnodeState::Expired;
    let mut unsynced = ctx(T0 + 700 + 181 * 60);
    unsynced.list_synced = false;
    entry.check(&unsynced, false, &config);
    assert_eq!(entry.state, PopnodeState::Expired);
}

#[test]
fn test_spent_collateral_wins() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 700)));
    entry.check(&ctx(T0 + 720), true, &config);
    assert_eq!(entry.state, PopnodeState::OutpointSpent);
    assert!(!entry.needs_check(T0 + 3600, true, &config));
}

#[test]
fn test_old_protocol_requires_update() {
    let config = RegistryConfig::default();
    let mut mnb = announcement(T0, Some(T0 + 700));
    mnb.protocol_version = 70_000;
    let mut entry = NodeEntry::from_announcement(&mnb);
    entry.check(&ctx(T0 + 720), false, &config);
    assert_eq!(entry.state, PopnodeState::UpdateRequired);
}

#[test]
fn test_watchdog_expiry_only_when_active() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 3 * 3600 - 60)));
    let now = T0 + 3 * 3600;

    entry.check(&ctx(now), false, &config);
    assert_eq!(entry.state, PopnodeState::Enabled);

    let mut active = ctx(now);
    active.watchdog_active = true;
    entry.check(&active, false, &config);
    assert_eq!(entry.state, PopnodeState::WatchdogExpired);
}

#[test]
fn test_pose_ban_and_unban() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 700)));
    for _ in 0..10 {
        entry.increase_pose_ban_score(&config);
    }
    assert_eq!(entry.pose_ban_score, config.pose_ban_max_score);

    entry.check(&ctx(T0 + 720), false, &config);
    assert_eq!(entry.state, PopnodeState::PoseBan);
    assert_eq!(entry.pose_ban_height, 110);

    let mut before = ctx(T0 + 730);
    before.height = 109;
    entry.check(&before, false, &config);
    assert_eq!(entry.state, PopnodeState::PoseBan);

    let mut after = ctx(T0 + 740);
    after.height = 110;
    entry.check(&after, false, &config);
    assert_eq!(entry.pose_ban_score, config.pose_ban_max_score - 1);
    assert_eq!(entry.state, PopnodeState::Enabled);
}

#[test]
fn test_pose_score_is_bounded_below() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, None));
    for _ in 0..20 {
        entry.decrease_pose_ban_score(&config);
    }
    assert_eq!(entry.pose_ban_score, -5);
    assert!(entry.is_pose_verified(&config));
}

#[test]
fn test_check_throttle() {
    let config = RegistryConfig::default();
    let mut entry = NodeEntry::from_announcement(&announcement(T0, Some(T0 + 700)));
    entry.check(&ctx(T0 + 720), false, &config);
    assert!(!entry.needs_check(T0 + 722, false, &config));
    assert!(entry.needs_check(T0 + 722, true, &config));
    assert!(entry.needs_check(T0 + 725, false, &config));
}

#[test]
fn test_announcement_hash_ignores_ping() {
    let a = announcement(T0, Some(T0 + 60));
    let b = announcement(T0, Some(T0 + 900));
    assert_eq!(a.hash(), b.hash());
    assert_ne!(a.content_hash(), b.content_hash());
    assert_ne!(a.hash(), announcement(T0 + 1, Some(T0 + 60)).hash());
}

#[test]
fn test_announcement_shape_checks() {
    let config = RegistryConfig::default();

    let future = announcement(T0 + 2 * 3600, None);
    let rejection = future.check_shape(T0, &config).unwrap_err();
    assert_eq!(rejection.reason, RejectReason::FutureSignatureTime);
    assert_eq!(rejection.misbehavior, 1);

    let mut bad_key = announcement(T0, None);
    bad_key.node_key = PublicKey::new(vec![1u8; 10]);
    assert_eq!(
        bad_key.check_shape(T0, &config).unwrap_err().reason,
        RejectReason::BadKeyFormat
    );

    let mut no_port = announcement(T0, None);
    no_port.addr = "203.0.113.5:0".parse().unwrap();
    assert_eq!(
        no_port.check_shape(T0, &config).unwrap_err().reason,
        RejectReason::InvalidAddress
    );

    assert!(announcement(T0, None).check_shape(T0, &config).is_ok());
}

#[test]
fn test_round_trip_through_entry() {
    let mnb = announcement(T0, Some(T0 + 60));
    let entry = NodeEntry::from_announcement(&mnb);
    assert_eq!(Announcement::from_entry(&entry), mnb);
}
