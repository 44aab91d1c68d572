//! Cache file support: snapshot the registry, restore it on startup.

use tracing::{info, warn};

use crate::domain::snapshot::{self, Restored};
use crate::domain::SERIALIZATION_VERSION;
use crate::error::PersistenceError;
use crate::ports::SnapshotStore;
use crate::service::PopnodeRegistry;

/// Result of loading the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// No cache yet.
    Missing,
    Loaded { entries: usize },
    /// The cache was written by another format version; the registry was
    /// reset to empty.
    Reset { found_version: String },
}

impl PopnodeRegistry {
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, PersistenceError> {
        self.encode_snapshot_with_version(SERIALIZATION_VERSION)
    }

    pub(crate) fn encode_snapshot_with_version(
        &self,
        version: &str,
    ) -> Result<Vec<u8>, PersistenceError> {
        let st = self.state.lock();
        snapshot::encode(&st, version)
    }

    /// Replace the registry contents with a decoded snapshot.
    ///
    /// A version mismatch empties the registry. A corrupt payload leaves it
    /// untouched and returns the error.
    pub fn restore_from_bytes(&self, bytes: &[u8]) -> Result<LoadStatus, PersistenceError> {
        let restored = snapshot::decode(bytes, SERIALIZATION_VERSION)?;
        let mut st = self.state.lock();
        match restored {
            Restored::Loaded(mut loaded) => {
                loaded.tip = st.tip;
                *st = loaded;
                info!("[popnode] restored {}", *st);
                Ok(LoadStatus::Loaded { entries: st.len() })
            }
            Restored::VersionMismatch { found } => {
                warn!(
                    "[popnode] cache version {:?} does not match {:?}, starting empty",
                    found, SERIALIZATION_VERSION
                );
                st.clear();
                Ok(LoadStatus::Reset {
                    found_version: found,
                })
            }
        }
    }

    pub fn save(&self, store: &dyn SnapshotStore) -> Result<(), PersistenceError> {
        let bytes = self.encode_snapshot()?;
        store.write(&bytes)?;
        info!("[popnode] cache written, {} bytes", bytes.len());
        Ok(())
    }

    pub fn load(&self, store: &dyn SnapshotStore) -> Result<LoadStatus, PersistenceError> {
        match store.read()? {
            None => Ok(LoadStatus::Missing),
            Some(bytes) => self.restore_from_bytes(&bytes),
        }
    }
}
