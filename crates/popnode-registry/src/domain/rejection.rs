//! Protocol rejections.
//!
//! Malformed or abusive input never fails the registry; each message
//! handler returns a [`Rejection`] carrying a reason and the misbehavior
//! score the session layer should charge the sender.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RejectReason {
    #[error("malformed announcement")]
    MalformedAnnouncement,
    #[error("signature time too far in the future")]
    FutureSignatureTime,
    #[error("signature time too old")]
    ExpiredSignatureTime,
    #[error("public key has a bad format")]
    BadKeyFormat,
    #[error("invalid network address")]
    InvalidAddress,
    #[error("wrong port for this network")]
    WrongPort,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("announcement older than the known one")]
    StaleAnnouncement,
    #[error("announcement with the same signature time already applied")]
    DuplicateSignatureTime,
    #[error("collateral key does not match the registered one")]
    CollateralKeyMismatch,
    #[error("entry is PoSe banned")]
    PoseBanned,
    #[error("collateral not yet confirmed")]
    CollateralNotConfirmed,
    #[error("collateral rejected by the ledger")]
    CollateralRejected,
    #[error("ping references an unknown block")]
    UnknownBlock,
    #[error("ping references a block too far below the tip")]
    PingBlockTooOld,
    #[error("ping arrived before the minimum interval")]
    PingTooEarly,
    #[error("entry is not known")]
    UnknownEntry,
    #[error("entry must update its protocol")]
    UpdateRequired,
    #[error("entry needs a new start")]
    NewStartRequired,
    #[error("entry is not enabled")]
    NotEnabled,
    #[error("verification was not requested")]
    VerificationNotRequested,
    #[error("verification request repeated within the window")]
    VerificationRepeated,
    #[error("verification challenge expired")]
    VerificationExpired,
    #[error("verification nonce mismatch")]
    NonceMismatch,
    #[error("verification block height mismatch")]
    HeightMismatch,
    #[error("address already verified")]
    AlreadyVerified,
    #[error("no entry at this address signed the challenge")]
    NoMatchingEntry,
    #[error("verification names the same identity twice")]
    SameIdentities,
    #[error("verification message is incomplete")]
    IncompleteVerification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Suggested misbehavior score for the sender, 0 for none.
    pub misbehavior: u32,
}

impl Rejection {
    pub fn new(reason: RejectReason, misbehavior: u32) -> Self {
        Self {
            reason,
            misbehavior,
        }
    }

    pub fn silent(reason: RejectReason) -> Self {
        Self::new(reason, 0)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (misbehavior {})", self.reason, self.misbehavior)
    }
}

impl std::error::Error for Rejection {}
