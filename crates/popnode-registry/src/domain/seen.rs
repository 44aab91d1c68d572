//! Dedup tables for gossip. Only accepted messages are recorded, so a
//! recorded hash is never processed twice.

use std::collections::{HashMap, HashSet};

use crate::domain::entry::{Announcement, Ping};
use crate::domain::types::{BlockHeight, Hash, Timestamp};
use crate::domain::verification::Verification;

#[derive(Debug, Clone, Default)]
pub struct SeenTables {
    /// Announcement hash -> (first seen, announcement).
    pub(crate) announcements: HashMap<Hash, (Timestamp, Announcement)>,
    pub(crate) pings: HashMap<Hash, Ping>,
    pub(crate) verifications: HashMap<Hash, Verification>,
}

impl SeenTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announcement(&self, hash: &Hash) -> Option<&Announcement> {
        self.announcements.get(hash).map(|(_, mnb)| mnb)
    }

    pub fn first_seen(&self, hash: &Hash) -> Option<Timestamp> {
        self.announcements.get(hash).map(|(at, _)| *at)
    }

    /// Record unless already present; an existing record is kept as is.
    pub fn record_announcement(&mut self, hash: Hash, now: Timestamp, announcement: Announcement) {
        self.announcements
            .entry(hash)
            .or_insert((now, announcement));
    }

    pub fn touch_announcement(&mut self, hash: &Hash, now: Timestamp) {
        if let Some((first_seen, _)) = self.announcements.get_mut(hash) {
            *first_seen = now;
        }
    }

    pub fn remove_announcement(&mut self, hash: &Hash) {
        self.announcements.remove(hash);
    }

    /// Refresh the embedded ping of a recorded announcement.
    pub fn refresh_announcement_ping(&mut self, hash: &Hash, ping: &Ping) {
        if let Some((_, mnb)) = self.announcements.get_mut(hash) {
            mnb.last_ping = Some(ping.clone());
        }
    }

    pub fn ping(&self, hash: &Hash) -> Option<&Ping> {
        self.pings.get(hash)
    }

    pub fn has_ping(&self, hash: &Hash) -> bool {
        self.pings.contains_key(hash)
    }

    pub fn record_ping(&mut self, ping: &Ping) {
        self.pings.insert(ping.hash(), ping.clone());
    }

    pub fn verification(&self, hash: &Hash) -> Option<&Verification> {
        self.verifications.get(hash)
    }

    pub fn has_verification(&self, hash: &Hash) -> bool {
        self.verifications.contains_key(hash)
    }

    pub fn record_verification(&mut self, verification: &Verification) {
        self.verifications
            .insert(verification.hash(), verification.clone());
    }

    /// Drop announcements first seen more than `max_age` ago unless their
    /// hash is in `live`. Returns how many were dropped.
    pub fn expire_announcements(
        &mut self,
        now: Timestamp,
        max_age: i64,
        live: &HashSet<Hash>,
    ) -> usize {
        let before = self.announcements.len();
        self.announcements
            .retain(|hash, (first_seen, _)| live.contains(hash) || now - *first_seen <= max_age);
        before - self.announcements.len()
    }

    pub fn expire_pings(&mut self, now: Timestamp, max_age: i64) {
        self.pings.retain(|_, ping| !ping.is_expired(now, max_age));
    }

    pub fn expire_verifications(&mut self, min_height: BlockHeight) {
        self.verifications
            .retain(|_, v| v.block_height >= min_height);
    }

    pub fn clear(&mut self) {
        self.announcements.clear();
        self.pings.clear();
        self.verifications.clear();
    }

    pub fn len(&self) -> (usize, usize, usize) {
        (
            self.announcements.len(),
            self.pings.len(),
            self.verifications.len(),
        )
    }
}
