//! # Verification Quorum (domain side)
//!
//! A [`Verification`] travels through three phases. The verifier sends a
//! challenge (`Request`: address, nonce, height); the node at that address
//! signs it (`Reply`, `sig1`); the verifier countersigns and gossips the
//! result (`Broadcast`, `sig2` plus both identities).
//!
//! [`VerificationBook`] tracks our own requests and the requests we answered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::domain::types::{hash_serialized, BlockHeight, Hash, NodeIdentity, Signature, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// The verified node, known once a reply was validated.
    pub identity1: Option<NodeIdentity>,
    /// The verifier.
    pub identity2: Option<NodeIdentity>,
    pub addr: SocketAddr,
    pub nonce: u32,
    pub block_height: BlockHeight,
    pub sig1: Signature,
    pub sig2: Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPhase {
    Request,
    Reply,
    Broadcast,
}

impl Verification {
    pub fn request(addr: SocketAddr, nonce: u32, block_height: BlockHeight) -> Self {
        Self {
            identity1: None,
            identity2: None,
            addr,
            nonce,
            block_height,
            sig1: Signature::default(),
            sig2: Signature::default(),
        }
    }

    pub fn phase(&self) -> VerificationPhase {
        if !self.sig2.is_empty() {
            VerificationPhase::Broadcast
        } else if !self.sig1.is_empty() {
            VerificationPhase::Reply
        } else {
            VerificationPhase::Request
        }
    }

    /// Dedup key: `H(identity1, identity2, addr, nonce, height)`.
    pub fn hash(&self) -> Hash {
        hash_serialized(&(
            &self.identity1,
            &self.identity2,
            &self.addr,
            self.nonce,
            self.block_height,
        ))
    }

    /// Message signed by the challenged node: `addr ‖ nonce ‖ blockHash`.
    pub fn reply_message(addr: &SocketAddr, nonce: u32, block_hash: &Hash) -> Vec<u8> {
        format!("{}{}{}", addr, nonce, hex::encode(block_hash)).into_bytes()
    }

    /// Message countersigned by the verifier: reply message ‖ id1 ‖ id2.
    pub fn broadcast_message(
        addr: &SocketAddr,
        nonce: u32,
        block_hash: &Hash,
        identity1: &NodeIdentity,
        identity2: &NodeIdentity,
    ) -> Vec<u8> {
        let mut message = Self::reply_message(addr, nonce, block_hash);
        message.extend_from_slice(format!("{}{}", identity1, identity2).as_bytes());
        message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Idle,
    RequestSent,
    AwaitingReply,
    Verified,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerification {
    pub challenge: Verification,
    pub requested_at: Timestamp,
    pub status: VerificationStatus,
}

impl PendingVerification {
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::RequestSent | VerificationStatus::AwaitingReply
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationBook {
    pending: HashMap<SocketAddr, PendingVerification>,
    /// Peers whose challenge we already answered, with the answer time.
    replied: HashMap<SocketAddr, Timestamp>,
}

impl VerificationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, addr: &SocketAddr) -> VerificationStatus {
        self.pending
            .get(addr)
            .map(|p| p.status)
            .unwrap_or(VerificationStatus::Idle)
    }

    pub fn pending(&self, addr: &SocketAddr) -> Option<&PendingVerification> {
        self.pending.get(addr)
    }

    /// A new request may go out unless one for `addr` is still within `expiry`.
    pub fn can_request(&self, addr: &SocketAddr, now: Timestamp, expiry: i64) -> bool {
        match self.pending.get(addr) {
            Some(p) => now - p.requested_at >= expiry,
            None => true,
        }
    }

    pub fn record_request(&mut self, challenge: Verification, now: Timestamp) {
        self.pending.insert(
            challenge.addr,
            PendingVerification {
                challenge,
                requested_at: now,
                status: VerificationStatus::RequestSent,
            },
        );
    }

    /// The session layer confirmed the request was put on the wire.
    pub fn mark_dispatched(&mut self, addr: &SocketAddr) -> bool {
        match self.pending.get_mut(addr) {
            Some(p) if p.status == VerificationStatus::RequestSent => {
                p.status = VerificationStatus::AwaitingReply;
                true
            }
            _ => false,
        }
    }

    pub fn mark_verified(&mut self, addr: &SocketAddr) {
        if let Some(p) = self.pending.get_mut(addr) {
            p.status = VerificationStatus::Verified;
        }
    }

    pub fn mark_failed(&mut self, addr: &SocketAddr) {
        if let Some(p) = self.pending.get_mut(addr) {
            p.status = VerificationStatus::Failed;
        }
    }

    pub fn mark_timed_out(&mut self, addr: &SocketAddr) {
        if let Some(p) = self.pending.get_mut(addr) {
            p.status = VerificationStatus::TimedOut;
        }
    }

    pub fn has_replied_within(&self, addr: &SocketAddr, now: Timestamp, expiry: i64) -> bool {
        self.replied
            .get(addr)
            .is_some_and(|at| now - *at < expiry)
    }

    pub fn record_reply(&mut self, addr: SocketAddr, now: Timestamp) {
        self.replied.insert(addr, now);
    }

    /// Time out open requests whose challenge height fell below
    /// `min_height`, and drop every record older than `expiry`.
    ///
    /// Returns the addresses that timed out in this call.
    pub fn expire(&mut self, now: Timestamp, expiry: i64, min_height: BlockHeight) -> Vec<SocketAddr> {
        let mut timed_out = Vec::new();
        for (addr, p) in self.pending.iter_mut() {
            if p.is_open() && p.challenge.block_height < min_height {
                p.status = VerificationStatus::TimedOut;
                timed_out.push(*addr);
            }
        }
        self.pending.retain(|_, p| now - p.requested_at < expiry);
        self.replied.retain(|_, at| now - *at < expiry);
        timed_out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().filter(|p| p.is_open()).count()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.replied.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.9:9888".parse().unwrap()
    }

    #[test]
    fn test_phase_follows_signatures() {
        let mut v = Verification::request(addr(), 7, 100);
        assert_eq!(v.phase(), VerificationPhase::Request);
        v.sig1 = Signature(vec![1]);
        assert_eq!(v.phase(), VerificationPhase::Reply);
        v.sig2 = Signature(vec![2]);
        assert_eq!(v.phase(), VerificationPhase::Broadcast);
    }

    #[test]
    fn test_broadcast_message_extends_reply_message() {
        let id1 = NodeIdentity::new([1u8; 32], 0);
        let id2 = NodeIdentity::new([2u8; 32], 0);
        let reply = Verification::reply_message(&addr(), 7, &[3u8; 32]);
        let broadcast = Verification::broadcast_message(&addr(), 7, &[3u8; 32], &id1, &id2);
        assert!(broadcast.starts_with(&reply));
        assert!(broadcast.len() > reply.len());
    }

    #[test]
    fn test_request_lifecycle() {
        let mut book = VerificationBook::new();
        assert_eq!(book.status(&addr()), VerificationStatus::Idle);

        book.record_request(Verification::request(addr(), 7, 100), 1_000);
        assert_eq!(book.status(&addr()), VerificationStatus::RequestSent);
        assert!(!book.can_request(&addr(), 1_100, 3_600));

        assert!(book.mark_dispatched(&addr()));
        assert!(!book.mark_dispatched(&addr()));
        assert_eq!(book.status(&addr()), VerificationStatus::AwaitingReply);

        book.mark_verified(&addr());
        assert_eq!(book.status(&addr()), VerificationStatus::Verified);
        assert_eq!(book.pending_count(), 0);
    }

    #[test]
    fn test_expire_times_out_then_drops() {
        let mut book = VerificationBook::new();
        book.record_request(Verification::request(addr(), 7, 100), 1_000);

        assert!(book.expire(1_010, 3_600, 100).is_empty());
        assert_eq!(book.expire(1_020, 3_600, 111), vec![addr()]);
        assert_eq!(book.status(&addr()), VerificationStatus::TimedOut);
        assert!(!book.can_request(&addr(), 1_020, 3_600));

        book.expire(4_600, 3_600, 111);
        assert_eq!(book.status(&addr()), VerificationStatus::Idle);
    }

    #[test]
    fn test_reply_window() {
        let mut book = VerificationBook::new();
        book.record_reply(addr(), 1_000);
        assert!(book.has_replied_within(&addr(), 2_000, 3_600));
        assert!(!book.has_replied_within(&addr(), 4_600, 3_600));
    }
}
