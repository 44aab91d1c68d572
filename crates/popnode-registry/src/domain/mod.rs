//! # Domain Layer
//!
//! Pure registry logic: entry liveness, the identity index, ranking,
//! verification and recovery bookkeeping, throttle and seen tables.
//! Nothing here performs I/O; the service layer feeds in chain facts,
//! collateral verdicts and signature checks.

pub mod config;
pub mod entry;
pub mod index;
pub mod messages;
pub mod ranking;
pub mod recovery;
pub mod rejection;
pub mod seen;
pub mod snapshot;
pub mod state;
pub mod throttle;
pub mod types;
pub mod verification;

pub use config::RegistryConfig;
pub use entry::{Announcement, CheckContext, NodeEntry, Ping, PopnodeState};
pub use index::IdentityIndex;
pub use messages::{DispatchOutcome, GossipMessage, Inventory, InventoryKind, OutboundAction};
pub use ranking::{calculate_score, rank_entries};
pub use recovery::{RecoveryBook, RecoveryReply, RecoveryRequest, RecoveryStatus};
pub use rejection::{RejectReason, Rejection};
pub use seen::SeenTables;
pub use snapshot::{Restored, SERIALIZATION_VERSION};
pub use state::RegistryState;
pub use throttle::ThrottleTables;
pub use types::{
    double_sha256, hash_serialized, is_local_addr, BlockHeight, Hash, NodeIdentity, PayeeScript,
    PublicKey, Signature, Timestamp,
};
pub use verification::{
    PendingVerification, Verification, VerificationBook, VerificationPhase, VerificationStatus,
};
