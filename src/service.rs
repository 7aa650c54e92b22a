//! Service layer for the local keychain store.

use crate::crypto::{ChainCrypto, KdfParams, SecretKey};
use crate::error::{KeychainError, Result};
use crate::models::{Chain, ChainLink, Keychain, STORE_VERSION};
use crate::utils;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Service for chain and link operations on a keychain document.
pub struct KeychainService {
    crypto: ChainCrypto,
    kdf: KdfParams,
    backup_on_save: bool,
}

impl Default for KeychainService {
    fn default() -> Self {
        Self::new()
    }
}

impl KeychainService {
    /// Create a new service with default KDF parameters.
    pub fn new() -> Self {
        Self {
            crypto: ChainCrypto::new(),
            kdf: KdfParams::default(),
            backup_on_save: false,
        }
    }

    /// Use these KDF parameters for chains created from now on.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Copy the store to a timestamped backup before each save.
    pub fn with_backup_on_save(mut self, enabled: bool) -> Self {
        self.backup_on_save = enabled;
        self
    }

    pub fn crypto(&self) -> &ChainCrypto {
        &self.crypto
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    /// Create an empty store file.
    pub fn init(&self, path: &Path, force: bool) -> Result<Keychain> {
        if path.exists() && !force {
            return Err(KeychainError::StoreExists(path.to_path_buf()));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let doc = Keychain::new();
        self.write_store(&doc, path)?;
        info!(path = %path.display(), "Initialized keychain store");
        Ok(doc)
    }

    /// Load a keychain document from file.
    pub fn load(&self, path: &Path) -> Result<Keychain> {
        if !path.exists() {
            return Err(KeychainError::StoreNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let doc: Keychain = serde_json::from_str(&content)?;

        if doc.version != STORE_VERSION {
            return Err(KeychainError::UnsupportedVersion(doc.version));
        }

        debug!(
            path = %path.display(),
            chains = doc.chains.len(),
            links = doc.links.len(),
            "Loaded keychain store"
        );
        Ok(doc)
    }

    /// Save a keychain document to file.
    pub fn save(&self, doc: &Keychain, path: &Path) -> Result<()> {
        if self.backup_on_save && path.exists() {
            self.create_backup(path)?;
        }
        self.write_store(doc, path)
    }

    /// Write the store through a temp file in the target directory so a
    /// crash never leaves a half-written store behind.
    fn write_store(&self, doc: &Keychain, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };

        let content = serde_json::to_string_pretty(doc)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".keychain-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        temp.write_all(content.as_bytes())?;
        temp.as_file().sync_all()?;
        utils::set_secure_permissions(temp.path())?;
        temp.persist(path).map_err(|e| KeychainError::Io(e.error))?;

        debug!(path = %path.display(), "Saved keychain store");
        Ok(())
    }

    /// Create a backup of the store file.
    fn create_backup(&self, path: &Path) -> Result<()> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let file_name = path
            .file_name()
            .ok_or_else(|| KeychainError::Other("Invalid file name".to_string()))?
            .to_string_lossy();
        let backup_path = path.with_file_name(format!("{file_name}.backup.{timestamp}"));

        std::fs::copy(path, &backup_path)?;
        utils::set_secure_permissions(&backup_path)?;
        info!(backup = %backup_path.display(), "Created store backup");
        Ok(())
    }

    /// Create a new chain protected by `key`.
    pub fn create_chain(
        &self,
        doc: &mut Keychain,
        name: &str,
        description: &str,
        key: &str,
    ) -> Result<Uuid> {
        let name = utils::validate_name(name)?;
        if doc.find_chain_by_name(&name).is_some() {
            return Err(KeychainError::ChainExists(name));
        }
        if key.is_empty() {
            return Err(KeychainError::EmptyKey);
        }

        let salt = self.crypto.generate_salt();
        let secret = self.crypto.derive_key(key, &salt, &self.kdf)?;
        let validator = self.crypto.create_validator(&secret)?;

        let chain = Chain {
            id: Uuid::new_v4(),
            name,
            description: description.trim().to_string(),
            salt: ChainCrypto::encode_salt(&salt),
            kdf: self.kdf,
            validator,
            key_generation: 0,
            modified: Utc::now(),
            deleted: false,
        };
        let id = chain.id;

        info!(chain = %chain.name, %id, "Created chain");
        doc.chains.push(chain);
        Ok(id)
    }

    /// Derive a chain's secret key and check it against the validator.
    pub fn unlock_chain(&self, chain: &Chain, key: &str) -> Result<SecretKey> {
        let salt = ChainCrypto::decode_salt(&chain.salt)?;
        let secret = self.crypto.derive_key(key, &salt, &chain.kdf)?;

        if !self.crypto.verify_validator(&chain.validator, &secret) {
            return Err(KeychainError::InvalidKey(chain.name.clone()));
        }

        Ok(secret)
    }

    /// Rename a chain and/or change its description.
    pub fn update_chain(
        &self,
        doc: &mut Keychain,
        chain_id: Uuid,
        new_name: Option<&str>,
        new_description: Option<&str>,
    ) -> Result<()> {
        let new_name = new_name.map(utils::validate_name).transpose()?;

        if let Some(name) = &new_name {
            if doc
                .find_chain_by_name(name)
                .is_some_and(|other| other.id != chain_id)
            {
                return Err(KeychainError::ChainExists(name.clone()));
            }
        }

        let chain = doc
            .find_chain_mut(chain_id)
            .ok_or_else(|| KeychainError::ChainNotFound(chain_id.to_string()))?;

        if let Some(name) = new_name {
            chain.name = name;
        }
        if let Some(description) = new_description {
            chain.description = description.trim().to_string();
        }
        chain.touch();

        Ok(())
    }

    /// Delete a chain together with all of its links.
    pub fn delete_chain(&self, doc: &mut Keychain, chain_id: Uuid) -> Result<()> {
        let chain = doc
            .find_chain_mut(chain_id)
            .ok_or_else(|| KeychainError::ChainNotFound(chain_id.to_string()))?;
        chain.deleted = true;
        chain.touch();
        let name = chain.name.clone();

        let mut removed = 0;
        for link in doc
            .links
            .iter_mut()
            .filter(|l| l.chain_id == chain_id && l.is_live())
        {
            link.deleted = true;
            link.touch();
            removed += 1;
        }

        info!(chain = %name, links = removed, "Deleted chain");
        Ok(())
    }

    /// Replace a chain's key, re-encrypting every link under the new one.
    pub fn change_chain_key(
        &self,
        doc: &mut Keychain,
        chain_id: Uuid,
        old_key: &str,
        new_key: &str,
    ) -> Result<()> {
        if new_key.is_empty() {
            return Err(KeychainError::EmptyKey);
        }

        let chain = doc
            .find_chain(chain_id)
            .ok_or_else(|| KeychainError::ChainNotFound(chain_id.to_string()))?;
        let old_secret = self.unlock_chain(chain, old_key)?;

        let salt = self.crypto.generate_salt();
        let new_secret = self.crypto.derive_key(new_key, &salt, &self.kdf)?;
        let generation = chain.key_generation + 1;

        // Re-encrypt everything before touching the document so a failure
        // leaves it unchanged.
        let mut reencrypted = Vec::new();
        for link in doc.chain_links(chain_id) {
            let plain = self.crypto.decrypt(&link.password, &old_secret)?;
            reencrypted.push((link.id, self.crypto.encrypt(&plain, &new_secret)?));
        }
        let validator = self.crypto.create_validator(&new_secret)?;

        for (link_id, password) in reencrypted {
            if let Some(link) = doc.find_link_mut(link_id) {
                link.password = password;
                link.key_generation = generation;
                link.touch();
            }
        }

        if let Some(chain) = doc.find_chain_mut(chain_id) {
            chain.salt = ChainCrypto::encode_salt(&salt);
            chain.kdf = self.kdf;
            chain.validator = validator;
            chain.key_generation = generation;
            chain.touch();
            info!(chain = %chain.name, generation, "Changed chain key");
        }

        Ok(())
    }

    /// Add a new link to an unlocked chain.
    pub fn add_link(
        &self,
        doc: &mut Keychain,
        chain_id: Uuid,
        secret: &SecretKey,
        name: &str,
        description: &str,
        password: &str,
    ) -> Result<Uuid> {
        let chain = doc
            .find_chain(chain_id)
            .ok_or_else(|| KeychainError::ChainNotFound(chain_id.to_string()))?;
        let name = utils::validate_name(name)?;

        if doc.find_link_by_name(chain_id, &name).is_some() {
            return Err(KeychainError::LinkExists(format!("{}/{}", chain.name, name)));
        }
        if password.is_empty() {
            return Err(KeychainError::EmptyPassword);
        }
        if !self.crypto.verify_validator(&chain.validator, secret) {
            return Err(KeychainError::InvalidKey(chain.name.clone()));
        }

        let link = ChainLink {
            id: Uuid::new_v4(),
            chain_id,
            name,
            description: description.trim().to_string(),
            password: self.crypto.encrypt(password, secret)?,
            key_generation: chain.key_generation,
            modified: Utc::now(),
            deleted: false,
        };
        let id = link.id;

        debug!(chain = %chain.name, link = %link.name, "Added chain link");
        doc.links.push(link);
        Ok(id)
    }

    /// Update any of a link's name, description and password.
    pub fn update_link(
        &self,
        doc: &mut Keychain,
        link_id: Uuid,
        secret: &SecretKey,
        new_name: Option<&str>,
        new_description: Option<&str>,
        new_password: Option<&str>,
    ) -> Result<()> {
        let link = doc
            .find_link(link_id)
            .ok_or_else(|| KeychainError::LinkNotFound(link_id.to_string()))?;
        let chain_id = link.chain_id;
        let chain = doc
            .find_chain(chain_id)
            .ok_or_else(|| KeychainError::ChainNotFound(chain_id.to_string()))?;

        if !self.crypto.verify_validator(&chain.validator, secret) {
            return Err(KeychainError::InvalidKey(chain.name.clone()));
        }

        let new_name = new_name.map(utils::validate_name).transpose()?;
        if let Some(name) = &new_name {
            if doc
                .find_link_by_name(chain_id, name)
                .is_some_and(|other| other.id != link_id)
            {
                return Err(KeychainError::LinkExists(format!("{}/{}", chain.name, name)));
            }
        }

        let new_password = match new_password {
            Some("") => return Err(KeychainError::EmptyPassword),
            Some(password) => Some(self.crypto.encrypt(password, secret)?),
            None => None,
        };
        let generation = chain.key_generation;

        let link = doc
            .find_link_mut(link_id)
            .ok_or_else(|| KeychainError::LinkNotFound(link_id.to_string()))?;
        if let Some(name) = new_name {
            link.name = name;
        }
        if let Some(description) = new_description {
            link.description = description.trim().to_string();
        }
        if let Some(password) = new_password {
            link.password = password;
            link.key_generation = generation;
        }
        link.touch();

        Ok(())
    }

    /// Delete a link.
    pub fn delete_link(&self, doc: &mut Keychain, link_id: Uuid) -> Result<()> {
        let link = doc
            .find_link_mut(link_id)
            .ok_or_else(|| KeychainError::LinkNotFound(link_id.to_string()))?;
        link.deleted = true;
        link.touch();
        debug!(link = %link.name, "Deleted chain link");
        Ok(())
    }

    /// Decrypt a link's password.
    pub fn reveal_password(&self, link: &ChainLink, secret: &SecretKey) -> Result<Zeroizing<String>> {
        self.crypto
            .decrypt(&link.password, secret)
            .map_err(KeychainError::from)
    }

    /// Search live links by name or description.
    pub fn search_links<'a>(
        &self,
        doc: &'a Keychain,
        query: &str,
        case_sensitive: bool,
    ) -> Vec<(&'a Chain, &'a ChainLink)> {
        let normalize = |s: &str| {
            if case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };
        let query = normalize(query);

        doc.links
            .iter()
            .filter(|link| link.is_live())
            .filter(|link| {
                normalize(&link.name).contains(&query)
                    || normalize(&link.description).contains(&query)
            })
            .filter_map(|link| doc.find_chain(link.chain_id).map(|chain| (chain, link)))
            .collect()
    }

    /// Drop tombstones last modified before `older_than`.
    pub fn purge_deleted(&self, doc: &mut Keychain, older_than: DateTime<Utc>) -> usize {
        let before = doc.chains.len() + doc.links.len();
        doc.chains
            .retain(|c| c.is_live() || c.modified >= older_than);
        doc.links
            .retain(|l| l.is_live() || l.modified >= older_than);
        let purged = before - doc.chains.len() - doc.links.len();

        if purged > 0 {
            info!(purged, "Purged deleted records");
        }
        purged
    }
}
