//! Persisted form of the registry.
//!
//! Layout (bincode): version tag, then entries, asked-us table, we-asked
//! table, we-asked-entry table, recovery requests, recovery replies,
//! watchdog vote time, dsq counter, seen announcements, seen pings,
//! forward identity index. A tag other than the expected one discards the
//! rest of the payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::IpAddr;

use crate::domain::entry::{Announcement, NodeEntry, Ping};
use crate::domain::index::IdentityIndex;
use crate::domain::recovery::{RecoveryBook, RecoveryReply, RecoveryRequest};
use crate::domain::state::RegistryState;
use crate::domain::types::{Hash, NodeIdentity, Timestamp};
use crate::error::PersistenceError;

pub const SERIALIZATION_VERSION: &str = "PopnodeRegistry-Version-4";

#[derive(Serialize)]
struct SnapshotRef<'a> {
    entries: &'a [NodeEntry],
    asked_us_for_list: &'a HashMap<IpAddr, Timestamp>,
    we_asked_for_list: &'a HashMap<IpAddr, Timestamp>,
    we_asked_for_entry: &'a HashMap<NodeIdentity, HashMap<IpAddr, Timestamp>>,
    recovery_requests: &'a HashMap<Hash, RecoveryRequest>,
    recovery_replies: &'a HashMap<Hash, Vec<RecoveryReply>>,
    last_watchdog_vote: Timestamp,
    dsq_count: i64,
    seen_announcements: &'a HashMap<Hash, (Timestamp, Announcement)>,
    seen_pings: &'a HashMap<Hash, Ping>,
    index: &'a IdentityIndex,
}

#[derive(Deserialize)]
struct SnapshotBody {
    entries: Vec<NodeEntry>,
    asked_us_for_list: HashMap<IpAddr, Timestamp>,
    we_asked_for_list: HashMap<IpAddr, Timestamp>,
    we_asked_for_entry: HashMap<NodeIdentity, HashMap<IpAddr, Timestamp>>,
    recovery_requests: HashMap<Hash, RecoveryRequest>,
    recovery_replies: HashMap<Hash, Vec<RecoveryReply>>,
    last_watchdog_vote: Timestamp,
    dsq_count: i64,
    seen_announcements: HashMap<Hash, (Timestamp, Announcement)>,
    seen_pings: HashMap<Hash, Ping>,
    index: IdentityIndex,
}

/// Outcome of decoding a snapshot.
#[derive(Debug)]
pub enum Restored {
    Loaded(RegistryState),
    VersionMismatch { found: String },
}

pub fn encode(state: &RegistryState, version: &str) -> Result<Vec<u8>, PersistenceError> {
    let body = SnapshotRef {
        entries: state.entries(),
        asked_us_for_list: &state.throttle.asked_us_for_list,
        we_asked_for_list: &state.throttle.we_asked_for_list,
        we_asked_for_entry: &state.throttle.we_asked_for_entry,
        recovery_requests: &state.recovery.requests,
        recovery_replies: &state.recovery.replies,
        last_watchdog_vote: state.last_watchdog_vote,
        dsq_count: state.dsq_count,
        seen_announcements: &state.seen.announcements,
        seen_pings: &state.seen.pings,
        index: &state.index,
    };

    let mut bytes = Vec::new();
    bincode::serialize_into(&mut bytes, version)
        .map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    bincode::serialize_into(&mut bytes, &body)
        .map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8], expected_version: &str) -> Result<Restored, PersistenceError> {
    let mut cursor = Cursor::new(bytes);
    let found: String = bincode::deserialize_from(&mut cursor)
        .map_err(|e| PersistenceError::Decoding(e.to_string()))?;
    if found != expected_version {
        return Ok(Restored::VersionMismatch { found });
    }

    let body: SnapshotBody = bincode::deserialize_from(&mut cursor)
        .map_err(|e| PersistenceError::Decoding(e.to_string()))?;

    let mut state = RegistryState::new();
    state.restore(body.entries, body.index);
    state.throttle.asked_us_for_list = body.asked_us_for_list;
    state.throttle.we_asked_for_list = body.we_asked_for_list;
    state.throttle.we_asked_for_entry = body.we_asked_for_entry;
    state.recovery = RecoveryBook::from_parts(body.recovery_requests, body.recovery_replies);
    state.last_watchdog_vote = body.last_watchdog_vote;
    state.dsq_count = body.dsq_count;
    state.seen.announcements = body.seen_announcements;
    state.seen.pings = body.seen_pings;
    Ok(Restored::Loaded(state))
}
