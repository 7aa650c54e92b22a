//! Configuration loaded from `config.toml`.

use crate::crypto::KdfParams;
use crate::error::{KeychainError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the store location.
pub const STORE_ENV: &str = "KEYCHAIN_STORE";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Path of the local store file
    pub store_path: PathBuf,
    /// Keep a timestamped copy of the store before every save
    pub backup_on_save: bool,
    /// Seconds before a copied password is cleared from the clipboard
    pub clipboard_timeout_secs: u64,
    /// Key derivation cost for newly created chains
    pub kdf: KdfParams,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            backup_on_save: false,
            clipboard_timeout_secs: 10,
            kdf: KdfParams::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Peer-to-peer sync settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub bind_address: IpAddr,
    /// Port to listen on (0 = auto-assign)
    pub port: u16,
    /// Name announced to peers
    pub peer_name: String,
    /// Per-frame I/O timeout
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7878,
            peer_name: default_peer_name(),
            timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("keychain").join("config.toml"))
    }

    /// Load configuration from `path`, or the default location when `None`.
    /// A missing file yields the defaults. `KEYCHAIN_STORE` overrides the
    /// store path.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match &path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                let config = Self::parse(&content)?;
                debug!(path = %path.display(), "Loaded configuration");
                config
            }
            _ => Self::default(),
        };

        if let Ok(store) = std::env::var(STORE_ENV) {
            if !store.is_empty() {
                config.store_path = PathBuf::from(store);
            }
        }

        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KeychainError::Config(e.to_string()))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| KeychainError::Config(e.to_string()))
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("keychain"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keychain.json")
}

fn default_peer_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "keychain".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_partial_config() {
        let config = Config::parse(
            r#"
backup_on_save = true

[kdf]
memory_kib = 1024
iterations = 1
parallelism = 1

[sync]
port = 9000
peer_name = "desktop"
"#,
        )
        .unwrap();

        assert!(config.backup_on_save);
        assert_eq!(config.clipboard_timeout_secs, 10);
        assert_eq!(config.kdf.memory_kib, 1024);
        assert_eq!(config.sync.port, 9000);
        assert_eq!(config.sync.peer_name, "desktop");
        assert_eq!(config.sync.timeout_secs, 30);
        assert_eq!(config.sync.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        assert!(matches!(
            Config::parse("[sync]\nport = \"nine\""),
            Err(KeychainError::Config(_))
        ));
    }

    #[test]
    fn test_to_toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        std::env::remove_var(STORE_ENV);
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.store_path, default_store_path());
    }

    #[test]
    #[serial]
    fn test_store_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "store_path = \"/from/file.json\"\n").unwrap();

        std::env::set_var(STORE_ENV, "/from/env.json");
        let config = Config::load(Some(&path)).unwrap();
        std::env::remove_var(STORE_ENV);

        assert_eq!(config.store_path, PathBuf::from("/from/env.json"));

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/from/file.json"));
    }
}
