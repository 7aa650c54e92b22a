//! Data models for chains, chain links and the keychain document.

use crate::crypto::{EncryptedPassword, KdfParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current on-disk store version.
pub const STORE_VERSION: &str = "1";

/// A named group of credentials protected by a user key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chain {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Base64 salt for deriving the chain's secret key
    pub salt: String,
    #[serde(default)]
    pub kdf: KdfParams,
    /// Encrypted marker used to check the chain key
    pub validator: EncryptedPassword,
    /// Bumped every time the chain key changes
    #[serde(default)]
    pub key_generation: u32,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl Chain {
    /// Mark the chain as modified now.
    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// A single credential belonging to a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainLink {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub password: EncryptedPassword,
    /// Key generation of the chain this password was encrypted under
    #[serde(default)]
    pub key_generation: u32,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl ChainLink {
    /// Mark the link as modified now.
    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// The whole local store: chains, links and their tombstones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keychain {
    pub version: String,
    #[serde(default)]
    pub chains: Vec<Chain>,
    #[serde(default)]
    pub links: Vec<ChainLink>,
}

impl Default for Keychain {
    fn default() -> Self {
        Self {
            version: STORE_VERSION.to_string(),
            chains: Vec::new(),
            links: Vec::new(),
        }
    }
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live chains in store order.
    pub fn live_chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter().filter(|c| c.is_live())
    }

    /// Find a live chain by id.
    pub fn find_chain(&self, id: Uuid) -> Option<&Chain> {
        self.live_chains().find(|c| c.id == id)
    }

    /// Find a live chain by id (mutable).
    pub fn find_chain_mut(&mut self, id: Uuid) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.id == id && c.is_live())
    }

    /// Find a live chain by name.
    pub fn find_chain_by_name(&self, name: &str) -> Option<&Chain> {
        self.live_chains().find(|c| c.name == name)
    }

    /// Live links of a chain in store order.
    pub fn chain_links(&self, chain_id: Uuid) -> impl Iterator<Item = &ChainLink> {
        self.links
            .iter()
            .filter(move |l| l.chain_id == chain_id && l.is_live())
    }

    /// Find a live link by id.
    pub fn find_link(&self, id: Uuid) -> Option<&ChainLink> {
        self.links.iter().find(|l| l.id == id && l.is_live())
    }

    /// Find a live link by id (mutable).
    pub fn find_link_mut(&mut self, id: Uuid) -> Option<&mut ChainLink> {
        self.links.iter_mut().find(|l| l.id == id && l.is_live())
    }

    /// Find a live link by name within a chain.
    pub fn find_link_by_name(&self, chain_id: Uuid, name: &str) -> Option<&ChainLink> {
        self.chain_links(chain_id).find(|l| l.name == name)
    }

    /// Number of tombstoned records.
    pub fn tombstone_count(&self) -> usize {
        self.chains.iter().filter(|c| c.deleted).count()
            + self.links.iter().filter(|l| l.deleted).count()
    }
}
