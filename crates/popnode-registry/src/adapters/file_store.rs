//! # Cache File
//!
//! Layout: `[MAGIC (8)][payload][double SHA-256 of payload (32)]`.
//! Writes go to a sibling temp file that is renamed into place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::domain::double_sha256;
use crate::error::PersistenceError;
use crate::ports::SnapshotStore;

const CACHE_MAGIC: &[u8; 8] = b"POPNODE\x01";
const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, e: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }

    fn corrupt(&self, reason: &str) -> PersistenceError {
        PersistenceError::Corrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write(&self, payload: &[u8]) -> Result<(), PersistenceError> {
        let mut buf = Vec::with_capacity(CACHE_MAGIC.len() + payload.len() + CHECKSUM_LEN);
        buf.extend_from_slice(CACHE_MAGIC);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&double_sha256(payload));

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &buf).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        if bytes.len() < CACHE_MAGIC.len() + CHECKSUM_LEN {
            return Err(self.corrupt("file too short"));
        }
        if bytes[..CACHE_MAGIC.len()] != CACHE_MAGIC[..] {
            return Err(self.corrupt("invalid magic"));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let payload = &body[CACHE_MAGIC.len()..];
        if double_sha256(payload)[..] != *checksum {
            return Err(self.corrupt("checksum mismatch"));
        }
        Ok(Some(payload.to_vec()))
    }
}
