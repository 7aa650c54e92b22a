//! keychain: a password manager that groups credentials into key-protected
//! chains and keeps copies on several machines in sync.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod prompt;
pub mod security;
pub mod service;
pub mod storable;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use error::{KeychainError, Result};
pub use models::{Chain, ChainLink, Keychain};
pub use service::KeychainService;
