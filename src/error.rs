//! Error types for keychain.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for keychain operations.
#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("Keychain store not found: {0}")]
    StoreNotFound(PathBuf),

    #[error("Keychain store already exists: {0}. Use --force to overwrite.")]
    StoreExists(PathBuf),

    #[error("Unsupported store version: {0}")]
    UnsupportedVersion(String),

    #[error("Chain not found: {0}")]
    ChainNotFound(String),

    #[error("Chain already exists: {0}")]
    ChainExists(String),

    #[error("Chain link not found: {0}")]
    LinkNotFound(String),

    #[error("Chain link already exists: {0}")]
    LinkExists(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid key for chain '{0}'")]
    InvalidKey(String),

    #[error("Chain key must not be empty")]
    EmptyKey,

    #[error("Password must not be empty")]
    EmptyPassword,

    #[error("Unsupported storable format: {0}")]
    UnsupportedFormat(String),

    #[error("Storable parse error at line {line}: {message}")]
    Storable { line: usize, message: String },

    #[error("Sync protocol error: {0}")]
    Protocol(String),

    #[error("Peer reported an error: {0}")]
    Peer(String),

    #[error("Sync timed out")]
    Timeout,

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Clipboard operation failed")]
    ClipboardFailed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("{0}")]
    Other(String),
}

impl KeychainError {
    /// Shorthand for a storable parse error.
    pub fn storable(line: usize, message: impl Into<String>) -> Self {
        Self::Storable {
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeychainError>;
