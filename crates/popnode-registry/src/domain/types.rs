//! Primitive value types shared by every registry component.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

/// 32-byte digest (double SHA-256).
pub type Hash = [u8; 32];

/// Seconds since the Unix epoch, network-adjusted.
pub type Timestamp = i64;

/// Height of a block in the ledger.
pub type BlockHeight = u64;

/// Double SHA-256 of `bytes`.
pub fn double_sha256(bytes: &[u8]) -> Hash {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Hash of the canonical bincode encoding of `value`.
pub fn hash_serialized<T: Serialize + ?Sized>(value: &T) -> Hash {
    double_sha256(&bincode::serialize(value).unwrap_or_default())
}

/// Returns true for loopback, private, link-local and unspecified addresses.
///
/// Local peers are exempt from list-request throttling and are never
/// advertised in list replies.
pub fn is_local_addr(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Identity of a popnode: the collateral outpoint `(txid, vout)`.
///
/// Ordered by `(txid, vout)`. Immutable once assigned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub txid: Hash,
    pub vout: u32,
}

impl NodeIdentity {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The null outpoint, which never identifies a real node.
    pub fn null() -> Self {
        Self {
            txid: [0u8; 32],
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.vout == u32::MAX
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex::encode(self.txid), self.vout)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({}..-{})", &hex::encode(self.txid)[..12], self.vout)
    }
}

/// SEC1-encoded public key bytes. The scheme itself lives behind the
/// signature ports.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Compressed (33) or uncompressed (65) SEC1 length.
    pub fn is_well_formed(&self) -> bool {
        matches!(self.0.len(), 33 | 65)
    }

    /// 20-byte key identifier used in signed messages and payee scripts.
    pub fn key_id(&self) -> [u8; 20] {
        let digest = double_sha256(&self.0);
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest[..20]);
        id
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0))
    }
}

/// Opaque signature bytes.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Output script paying a popnode's collateral key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayeeScript(pub Vec<u8>);

impl PayeeScript {
    /// Pay-to-key-hash script for `key`:
    /// `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`.
    pub fn for_key(key: &PublicKey) -> Self {
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[0x76, 0xa9, 0x14]);
        script.extend_from_slice(&key.key_id());
        script.extend_from_slice(&[0x88, 0xac]);
        Self(script)
    }
}
