//! # Adapters
//!
//! Production implementations of the outbound ports.
//!
//! - `SystemTimeSource` - wall clock
//! - `OsRandomSource` / `SeededRandomSource` - `rand` generators
//! - `EcdsaMessageSigner` / `EcdsaSignatureVerifier` - secp256k1 via `k256`
//! - `StaticConfigProvider` / `TomlConfigProvider` - registry configuration
//! - `FileSnapshotStore` - the registry cache file
//! - `ConnectionDrain` / `MaintenanceTask` - tokio background tasks

pub mod config;
pub mod crypto;
pub mod file_store;
pub mod random;
pub mod tasks;
pub mod time;

pub use config::{StaticConfigProvider, TomlConfigProvider};
pub use crypto::{local_popnode, EcdsaMessageSigner, EcdsaSignatureVerifier};
pub use file_store::FileSnapshotStore;
pub use random::{OsRandomSource, SeededRandomSource};
pub use tasks::{ConnectionDrain, MaintenanceTask};
pub use time::SystemTimeSource;
