//! Request throttles. Each table stores the time at which the peer may
//! be served (or asked) again.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::domain::types::{NodeIdentity, Timestamp};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleTables {
    pub(crate) asked_us_for_list: HashMap<IpAddr, Timestamp>,
    pub(crate) we_asked_for_list: HashMap<IpAddr, Timestamp>,
    pub(crate) we_asked_for_entry: HashMap<NodeIdentity, HashMap<IpAddr, Timestamp>>,
}

impl ThrottleTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a full-list request from `peer` unless one was served within
    /// the window; an admitted request starts a new window.
    pub fn admit_list_request(&mut self, peer: IpAddr, now: Timestamp, interval: i64) -> bool {
        if let Some(until) = self.asked_us_for_list.get(&peer) {
            if now < *until {
                return false;
            }
        }
        self.asked_us_for_list.insert(peer, now + interval);
        true
    }

    /// Reserve a full-list request to `peer`. False if still throttled.
    pub fn reserve_list_ask(&mut self, peer: IpAddr, now: Timestamp, interval: i64) -> bool {
        if let Some(until) = self.we_asked_for_list.get(&peer) {
            if now < *until {
                return false;
            }
        }
        self.we_asked_for_list.insert(peer, now + interval);
        true
    }

    /// Reserve an entry request about `identity` to `peer`.
    pub fn reserve_entry_ask(
        &mut self,
        identity: NodeIdentity,
        peer: IpAddr,
        now: Timestamp,
        interval: i64,
    ) -> bool {
        let asked = self.we_asked_for_entry.entry(identity).or_default();
        if let Some(until) = asked.get(&peer) {
            if now < *until {
                return false;
            }
        }
        asked.insert(peer, now + interval);
        true
    }

    pub fn asked_entry_recently(&self, identity: &NodeIdentity, peer: &IpAddr, now: Timestamp) -> bool {
        self.we_asked_for_entry
            .get(identity)
            .and_then(|asked| asked.get(peer))
            .is_some_and(|until| now < *until)
    }

    pub fn forget_entry(&mut self, identity: &NodeIdentity) {
        self.we_asked_for_entry.remove(identity);
    }

    pub fn expire(&mut self, now: Timestamp) {
        self.asked_us_for_list.retain(|_, until| *until >= now);
        self.we_asked_for_list.retain(|_, until| *until >= now);
        for asked in self.we_asked_for_entry.values_mut() {
            asked.retain(|_, until| *until >= now);
        }
        self.we_asked_for_entry.retain(|_, asked| !asked.is_empty());
    }

    pub fn clear(&mut self) {
        self.asked_us_for_list.clear();
        self.we_asked_for_list.clear();
        self.we_asked_for_entry.clear();
    }

    pub fn len(&self) -> (usize, usize, usize) {
        (
            self.asked_us_for_list.len(),
            self.we_asked_for_list.len(),
            self.we_asked_for_entry.len(),
        )
    }
}
