//! # Recovery Protocol (domain side)
//!
//! When an entry needs a new start, the registry asks a panel of ranked
//! peers for their copy of its announcement. Requests and reply sets are
//! keyed by the stale announcement hash.
//!
//! ```text
//! open ──► Pending ──(quorum of replies)──► Resolved
//!             │
//!             └──(window passed)──► Abandoned
//! ```
//!
//! A record of either outcome stays until the retry delay has elapsed,
//! which blocks a second request for the same hash.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use crate::domain::entry::Announcement;
use crate::domain::types::{Hash, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Pending,
    Resolved,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub requested_at: Timestamp,
    /// Peers asked and not yet answered.
    pub asked: BTreeSet<IpAddr>,
    pub status: RecoveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReply {
    pub peer: IpAddr,
    pub announcement: Announcement,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryBook {
    pub(crate) requests: HashMap<Hash, RecoveryRequest>,
    pub(crate) replies: HashMap<Hash, Vec<RecoveryReply>>,
    /// Connections to make, drained outside the registry lock.
    scheduled: Vec<(SocketAddr, Hash)>,
}

impl RecoveryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        requests: HashMap<Hash, RecoveryRequest>,
        replies: HashMap<Hash, Vec<RecoveryReply>>,
    ) -> Self {
        Self {
            requests,
            replies,
            scheduled: Vec::new(),
        }
    }

    pub fn is_requested(&self, hash: &Hash) -> bool {
        self.requests.contains_key(hash)
    }

    pub fn request(&self, hash: &Hash) -> Option<&RecoveryRequest> {
        self.requests.get(hash)
    }

    pub fn replies(&self, hash: &Hash) -> &[RecoveryReply] {
        self.replies.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Record a request and schedule one connection per target.
    pub fn open(
        &mut self,
        hash: Hash,
        now: Timestamp,
        asked: BTreeSet<IpAddr>,
        targets: impl IntoIterator<Item = SocketAddr>,
    ) {
        self.scheduled
            .extend(targets.into_iter().map(|addr| (addr, hash)));
        self.requests.insert(
            hash,
            RecoveryRequest {
                requested_at: now,
                asked,
                status: RecoveryStatus::Pending,
            },
        );
    }

    /// Consume `peer` from the asked set if the request is still in its
    /// reply window. Each asked peer is consumed at most once.
    pub fn take_asked_peer(&mut self, hash: &Hash, peer: &IpAddr, now: Timestamp, wait: i64) -> bool {
        match self.requests.get_mut(hash) {
            Some(request)
                if request.status == RecoveryStatus::Pending
                    && now < request.requested_at + wait =>
            {
                request.asked.remove(peer)
            }
            _ => false,
        }
    }

    /// Append a candidate, one per peer. Returns the reply count.
    pub fn record_reply(&mut self, hash: Hash, peer: IpAddr, announcement: Announcement) -> usize {
        let replies = self.replies.entry(hash).or_default();
        if !replies.iter().any(|r| r.peer == peer) {
            replies.push(RecoveryReply { peer, announcement });
        }
        replies.len()
    }

    /// The announcement most replies agree on, once at least `required`
    /// replies arrived. Ties go to the fresher ping.
    pub fn quorum_candidate(&self, hash: &Hash, required: usize) -> Option<Announcement> {
        let replies = self.replies.get(hash)?;
        if replies.len() < required {
            return None;
        }
        let mut tally: HashMap<Hash, (usize, &Announcement)> = HashMap::new();
        for reply in replies {
            tally
                .entry(reply.announcement.content_hash())
                .or_insert((0, &reply.announcement))
                .0 += 1;
        }
        tally
            .into_iter()
            .max_by(|(ha, (ca, a)), (hb, (cb, b))| {
                ca.cmp(cb)
                    .then_with(|| a.last_ping_time().cmp(&b.last_ping_time()))
                    .then_with(|| hb.cmp(ha))
            })
            .map(|(_, (_, mnb))| mnb.clone())
    }

    pub fn resolve(&mut self, hash: &Hash) {
        if let Some(request) = self.requests.get_mut(hash) {
            request.status = RecoveryStatus::Resolved;
            request.asked.clear();
        }
        self.replies.remove(hash);
    }

    pub fn abandon(&mut self, hash: &Hash) {
        if let Some(request) = self.requests.get_mut(hash) {
            request.status = RecoveryStatus::Abandoned;
            request.asked.clear();
        }
        self.replies.remove(hash);
    }

    /// Pending requests whose reply window has closed.
    pub fn window_closed(&self, now: Timestamp, wait: i64) -> Vec<Hash> {
        self.requests
            .iter()
            .filter(|(_, r)| r.status == RecoveryStatus::Pending && now >= r.requested_at + wait)
            .map(|(hash, _)| *hash)
            .collect()
    }

    /// Forget requests older than `retry`, making their hash requestable again.
    pub fn prune(&mut self, now: Timestamp, retry: i64) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, r| now - r.requested_at <= retry);
        let requests = &self.requests;
        self.replies.retain(|hash, _| requests.contains_key(hash));
        before - self.requests.len()
    }

    /// Pop the lowest scheduled address with every hash queued for it.
    pub fn pop_scheduled(&mut self) -> Option<(SocketAddr, BTreeSet<Hash>)> {
        if self.scheduled.is_empty() {
            return None;
        }
        self.scheduled.sort();
        let addr = self.scheduled[0].0;
        let mut hashes = BTreeSet::new();
        self.scheduled.retain(|(a, h)| {
            if *a == addr {
                hashes.insert(*h);
                false
            } else {
                true
            }
        });
        Some((addr, hashes))
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn pending_len(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.status == RecoveryStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.replies.clear();
        self.scheduled.clear();
    }
}
