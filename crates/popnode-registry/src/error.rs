//! Error types for the popnode registry.
//!
//! Protocol violations by peers are not errors; they are reported as
//! [`crate::domain::Rejection`] values. The types here cover local failures.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for registry operations that touch storage, keys or config.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Top-level error for the registry service.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("signing failure: {0}")]
    Signer(#[from] SignerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors reading or writing the registry cache.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("snapshot encoding failed: {0}")]
    Encoding(String),

    #[error("snapshot decoding failed: {0}")]
    Decoding(String),
}

/// Errors produced by a [`crate::ports::outbound::MessageSigner`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("invalid signing key")]
    InvalidKey,

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Errors loading a [`crate::domain::RegistryConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value: {0}")]
    Invalid(String),
}
