//! Interchange representation of chains for file import and export.
//!
//! A [`Storable`] is either *private*, carrying each chain's salt, KDF
//! parameters and validator with link passwords left encrypted, or
//! *plaintext*, carrying clear passwords and no key material at all.

mod csv;
mod json;
mod txt;

use crate::crypto::{EncryptedPassword, KdfParams, SecretKey};
use crate::error::{KeychainError, Result};
use crate::models::{Chain, ChainLink, Keychain};
use crate::service::KeychainService;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

/// One or more chains in interchange form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Storable {
    pub private: bool,
    #[serde(default)]
    pub chains: Vec<StorableChain>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorableChain {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<EncryptedPassword>,
    #[serde(default)]
    pub links: Vec<StorableChainLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorableChainLink {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ciphertext when private, clear password otherwise
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

impl StorableChain {
    /// Key material of a private chain as a detached [`Chain`] record.
    fn key_record(&self) -> Option<Chain> {
        Some(Chain {
            id: Uuid::nil(),
            name: self.name.clone(),
            description: self.description.clone(),
            salt: self.salt.clone()?,
            kdf: self.kdf?,
            validator: self.validator.clone()?,
            key_generation: 0,
            modified: Utc::now(),
            deleted: false,
        })
    }
}

impl StorableChainLink {
    fn encrypted(&self) -> Option<EncryptedPassword> {
        self.iv.as_ref().map(|iv| EncryptedPassword {
            ciphertext: self.password.clone(),
            iv: iv.clone(),
        })
    }
}

impl Storable {
    /// Check that key material is present exactly when the storable is private.
    pub fn validate(&self) -> Result<()> {
        for chain in &self.chains {
            let has_keys = chain.salt.is_some() && chain.kdf.is_some() && chain.validator.is_some();
            let has_any_key =
                chain.salt.is_some() || chain.kdf.is_some() || chain.validator.is_some();

            if self.private && !has_keys {
                return Err(KeychainError::storable(
                    0,
                    format!("private chain '{}' is missing key material", chain.name),
                ));
            }
            if !self.private && has_any_key {
                return Err(KeychainError::storable(
                    0,
                    format!("plaintext chain '{}' carries key material", chain.name),
                ));
            }

            for link in &chain.links {
                if self.private != link.iv.is_some() {
                    return Err(KeychainError::storable(
                        0,
                        format!(
                            "link '{}/{}' does not match the {} flag",
                            chain.name,
                            link.name,
                            if self.private { "private" } else { "plaintext" }
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Interchange file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorableFormat {
    Json,
    Csv,
    Txt,
}

impl StorableFormat {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "txt" => Ok(Self::Txt),
            _ => Err(KeychainError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Serialize a storable in the given format.
pub fn encode(storable: &Storable, format: StorableFormat) -> Result<String> {
    storable.validate()?;
    match format {
        StorableFormat::Json => json::encode(storable),
        StorableFormat::Csv => Ok(csv::encode(storable)),
        StorableFormat::Txt => Ok(txt::encode(storable)),
    }
}

/// Parse a storable from text in the given format.
pub fn decode(text: &str, format: StorableFormat) -> Result<Storable> {
    let storable = match format {
        StorableFormat::Json => json::decode(text)?,
        StorableFormat::Csv => csv::decode(text)?,
        StorableFormat::Txt => txt::decode(text)?,
    };
    storable.validate()?;
    Ok(storable)
}

/// Read a storable file, detecting the format from its extension if needed.
pub fn read_file(path: &Path, format: Option<StorableFormat>) -> Result<Storable> {
    let format = match format {
        Some(format) => format,
        None => StorableFormat::from_path(path)?,
    };
    let text = std::fs::read_to_string(path)?;
    let storable = decode(&text, format)?;
    debug!(path = %path.display(), ?format, chains = storable.chains.len(), "Read storable");
    Ok(storable)
}

/// Write a storable file with owner-only permissions.
pub fn write_file(path: &Path, storable: &Storable, format: Option<StorableFormat>) -> Result<()> {
    let format = match format {
        Some(format) => format,
        None => StorableFormat::from_path(path)?,
    };
    let text = encode(storable, format)?;
    std::fs::write(path, text)?;
    crate::utils::set_secure_permissions(path)?;
    debug!(path = %path.display(), ?format, "Wrote storable");
    Ok(())
}

/// Why a key is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Key of an existing local chain
    Local,
    /// Key protecting a chain inside a private storable
    Storable,
    /// Key for a chain about to be created
    New,
}

/// Supplies chain keys during import and export.
pub trait KeyProvider {
    fn key_for(&mut self, chain_name: &str, purpose: KeyPurpose) -> Result<String>;
}

impl KeyProvider for HashMap<String, String> {
    fn key_for(&mut self, chain_name: &str, _purpose: KeyPurpose) -> Result<String> {
        self.get(chain_name)
            .cloned()
            .ok_or_else(|| KeychainError::InvalidKey(chain_name.to_string()))
    }
}

/// Build a storable from the given chains (all live chains when empty).
pub fn export(
    service: &KeychainService,
    doc: &Keychain,
    chain_ids: &[Uuid],
    private: bool,
    keys: &mut dyn KeyProvider,
) -> Result<Storable> {
    let chains: Vec<&Chain> = if chain_ids.is_empty() {
        doc.live_chains().collect()
    } else {
        chain_ids
            .iter()
            .map(|id| {
                doc.find_chain(*id)
                    .ok_or_else(|| KeychainError::ChainNotFound(id.to_string()))
            })
            .collect::<Result<_>>()?
    };

    let mut storable = Storable {
        private,
        chains: Vec::with_capacity(chains.len()),
    };

    for chain in chains {
        let links: Vec<StorableChainLink> = if private {
            doc.chain_links(chain.id)
                .map(|link| StorableChainLink {
                    name: link.name.clone(),
                    description: link.description.clone(),
                    password: link.password.ciphertext.clone(),
                    iv: Some(link.password.iv.clone()),
                })
                .collect()
        } else {
            let key = Zeroizing::new(keys.key_for(&chain.name, KeyPurpose::Local)?);
            let secret = service.unlock_chain(chain, &key)?;
            doc.chain_links(chain.id)
                .map(|link| {
                    let password = service.reveal_password(link, &secret)?;
                    Ok(StorableChainLink {
                        name: link.name.clone(),
                        description: link.description.clone(),
                        password: password.to_string(),
                        iv: None,
                    })
                })
                .collect::<Result<_>>()?
        };

        storable.chains.push(StorableChain {
            name: chain.name.clone(),
            description: chain.description.clone(),
            salt: private.then(|| chain.salt.clone()),
            kdf: private.then_some(chain.kdf),
            validator: private.then(|| chain.validator.clone()),
            links,
        });
    }

    info!(
        chains = storable.chains.len(),
        private, "Exported chains"
    );
    Ok(storable)
}

/// Counts of what an import changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub chains_created: usize,
    pub links_created: usize,
    pub links_updated: usize,
    pub links_unchanged: usize,
}

/// Merge a storable into the document.
///
/// Chains are matched by name. A private chain that does not exist locally
/// is copied verbatim and needs no key. Every other case asks `keys` for the
/// keys required to decrypt and re-encrypt.
pub fn import(
    service: &KeychainService,
    doc: &mut Keychain,
    storable: &Storable,
    keys: &mut dyn KeyProvider,
) -> Result<ImportReport> {
    storable.validate()?;
    let mut report = ImportReport::default();

    for source in &storable.chains {
        let existing = doc.find_chain_by_name(source.name.trim()).map(|c| c.id);

        match (existing, storable.private) {
            (None, true) => {
                copy_private_chain(service, doc, source, &mut report)?;
            }
            (None, false) => {
                let key = Zeroizing::new(keys.key_for(&source.name, KeyPurpose::New)?);
                let chain_id = service.create_chain(doc, &source.name, &source.description, &key)?;
                report.chains_created += 1;
                let chain = doc
                    .find_chain(chain_id)
                    .ok_or_else(|| KeychainError::ChainNotFound(source.name.clone()))?;
                let secret = service.unlock_chain(chain, &key)?;
                merge_links(service, doc, chain_id, &secret, source, None, &mut report)?;
            }
            (Some(chain_id), private) => {
                let chain = doc
                    .find_chain(chain_id)
                    .ok_or_else(|| KeychainError::ChainNotFound(source.name.clone()))?;
                let key = Zeroizing::new(keys.key_for(&chain.name, KeyPurpose::Local)?);
                let secret = service.unlock_chain(chain, &key)?;

                let source_secret = if private {
                    let record = source.key_record().ok_or_else(|| {
                        KeychainError::storable(0, format!("chain '{}' has no key", source.name))
                    })?;
                    let source_key =
                        Zeroizing::new(keys.key_for(&source.name, KeyPurpose::Storable)?);
                    Some(service.unlock_chain(&record, &source_key)?)
                } else {
                    None
                };

                merge_links(
                    service,
                    doc,
                    chain_id,
                    &secret,
                    source,
                    source_secret.as_ref(),
                    &mut report,
                )?;
            }
        }
    }

    info!(
        chains_created = report.chains_created,
        links_created = report.links_created,
        links_updated = report.links_updated,
        "Imported storable"
    );
    Ok(report)
}

fn copy_private_chain(
    service: &KeychainService,
    doc: &mut Keychain,
    source: &StorableChain,
    report: &mut ImportReport,
) -> Result<()> {
    let mut chain = source
        .key_record()
        .ok_or_else(|| KeychainError::storable(0, format!("chain '{}' has no key", source.name)))?;
    service
        .crypto()
        .check_key_params(&chain.salt, &chain.kdf)
        .map_err(|e| {
            KeychainError::storable(
                0,
                format!("chain '{}' has unusable key material: {e}", source.name),
            )
        })?;
    chain.id = Uuid::new_v4();
    chain.name = crate::utils::validate_name(&source.name)?;
    chain.description = source.description.trim().to_string();

    let mut seen = std::collections::HashSet::new();
    for source_link in &source.links {
        let name = crate::utils::validate_name(&source_link.name)?;
        if !seen.insert(name.clone()) {
            return Err(KeychainError::LinkExists(format!("{}/{}", chain.name, name)));
        }
        let password = source_link.encrypted().ok_or_else(|| {
            KeychainError::storable(0, format!("link '{}' has no iv", source_link.name))
        })?;
        doc.links.push(ChainLink {
            id: Uuid::new_v4(),
            chain_id: chain.id,
            name,
            description: source_link.description.trim().to_string(),
            password,
            key_generation: 0,
            modified: Utc::now(),
            deleted: false,
        });
        report.links_created += 1;
    }

    doc.chains.push(chain);
    report.chains_created += 1;
    Ok(())
}

fn merge_links(
    service: &KeychainService,
    doc: &mut Keychain,
    chain_id: Uuid,
    secret: &SecretKey,
    source: &StorableChain,
    source_secret: Option<&SecretKey>,
    report: &mut ImportReport,
) -> Result<()> {
    for source_link in &source.links {
        let password = match (source_secret, source_link.encrypted()) {
            (Some(source_secret), Some(encrypted)) => {
                service.crypto().decrypt(&encrypted, source_secret)?
            }
            _ => Zeroizing::new(source_link.password.clone()),
        };

        let name = crate::utils::validate_name(&source_link.name)?;
        let existing = doc
            .find_link_by_name(chain_id, &name)
            .map(|link| -> Result<_> {
                let current = service.reveal_password(link, secret)?;
                let same = *current == *password
                    && link.description == source_link.description.trim();
                Ok((link.id, same))
            })
            .transpose()?;

        match existing {
            Some((_, true)) => report.links_unchanged += 1,
            Some((link_id, false)) => {
                service.update_link(
                    doc,
                    link_id,
                    secret,
                    None,
                    Some(source_link.description.as_str()),
                    Some(password.as_str()),
                )?;
                report.links_updated += 1;
            }
            None => {
                service.add_link(
                    doc,
                    chain_id,
                    secret,
                    &name,
                    &source_link.description,
                    &password,
                )?;
                report.links_created += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChainCrypto;

    fn service() -> KeychainService {
        KeychainService::new().with_kdf(KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
    }

    fn keys(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(service: &KeychainService) -> (Keychain, Uuid) {
        let mut doc = Keychain::new();
        let id = service.create_chain(&mut doc, "Work", "Office", "key").unwrap();
        let secret = service
            .unlock_chain(doc.find_chain(id).unwrap(), "key")
            .unwrap();
        service
            .add_link(&mut doc, id, &secret, "Email", "Mail", "pw1")
            .unwrap();
        service
            .add_link(&mut doc, id, &secret, "VPN", "", "pw2")
            .unwrap();
        (doc, id)
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            StorableFormat::from_path(Path::new("a/b.JSON")).unwrap(),
            StorableFormat::Json
        );
        assert_eq!(
            StorableFormat::from_path(Path::new("x.csv")).unwrap(),
            StorableFormat::Csv
        );
        assert_eq!(
            StorableFormat::from_path(Path::new("x.txt")).unwrap(),
            StorableFormat::Txt
        );
        assert!(StorableFormat::from_path(Path::new("x.xml")).is_err());
        assert!(StorableFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn test_export_plaintext_needs_key() {
        let service = service();
        let (doc, _) = sample(&service);

        let storable = export(&service, &doc, &[], false, &mut keys(&[("Work", "key")])).unwrap();
        assert!(!storable.private);
        assert_eq!(storable.chains[0].links[0].password, "pw1");
        assert!(storable.chains[0].salt.is_none());

        assert!(export(&service, &doc, &[], false, &mut keys(&[("Work", "bad")])).is_err());
    }

    #[test]
    fn test_export_private_keeps_ciphertext() {
        let service = service();
        let (doc, id) = sample(&service);

        let storable = export(&service, &doc, &[id], true, &mut keys(&[])).unwrap();
        assert!(storable.private);
        let link = &storable.chains[0].links[0];
        assert_eq!(link.password, doc.chain_links(id).next().unwrap().password.ciphertext);
        assert!(link.iv.is_some());
        storable.validate().unwrap();
    }

    #[test]
    fn test_import_private_into_empty_store() {
        let service = service();
        let (doc, _) = sample(&service);
        let storable = export(&service, &doc, &[], true, &mut keys(&[])).unwrap();

        let mut target = Keychain::new();
        let report = import(&service, &mut target, &storable, &mut keys(&[])).unwrap();
        assert_eq!(report.chains_created, 1);
        assert_eq!(report.links_created, 2);

        let chain = target.find_chain_by_name("Work").unwrap();
        let secret = service.unlock_chain(chain, "key").unwrap();
        let link = target.find_link_by_name(chain.id, "VPN").unwrap();
        assert_eq!(service.reveal_password(link, &secret).unwrap().as_str(), "pw2");
    }

    #[test]
    fn test_import_plaintext_creates_chain_with_new_key() {
        let service = service();
        let (doc, _) = sample(&service);
        let storable = export(&service, &doc, &[], false, &mut keys(&[("Work", "key")])).unwrap();

        let mut target = Keychain::new();
        import(&service, &mut target, &storable, &mut keys(&[("Work", "fresh")])).unwrap();

        let chain = target.find_chain_by_name("Work").unwrap();
        assert!(service.unlock_chain(chain, "key").is_err());
        let secret = service.unlock_chain(chain, "fresh").unwrap();
        let link = target.find_link_by_name(chain.id, "Email").unwrap();
        assert_eq!(service.reveal_password(link, &secret).unwrap().as_str(), "pw1");
    }

    #[test]
    fn test_import_private_into_existing_chain_reencrypts() {
        let service = service();
        let (source_doc, _) = sample(&service);
        let storable = export(&service, &source_doc, &[], true, &mut keys(&[])).unwrap();

        let mut target = Keychain::new();
        let id = service.create_chain(&mut target, "Work", "", "local").unwrap();
        let secret = service
            .unlock_chain(target.find_chain(id).unwrap(), "local")
            .unwrap();
        service
            .add_link(&mut target, id, &secret, "Email", "Mail", "pw1")
            .unwrap();
        service
            .add_link(&mut target, id, &secret, "VPN", "", "stale")
            .unwrap();

        struct Keys;
        impl KeyProvider for Keys {
            fn key_for(&mut self, _name: &str, purpose: KeyPurpose) -> Result<String> {
                Ok(match purpose {
                    KeyPurpose::Storable => "key".to_string(),
                    _ => "local".to_string(),
                })
            }
        }

        let report = import(&service, &mut target, &storable, &mut Keys).unwrap();
        assert_eq!(report.chains_created, 0);
        assert_eq!(report.links_unchanged, 1);
        assert_eq!(report.links_updated, 1);

        let link = target.find_link_by_name(id, "VPN").unwrap();
        assert_eq!(service.reveal_password(link, &secret).unwrap().as_str(), "pw2");
    }

    #[test]
    fn test_validate_rejects_mixed_content() {
        let storable = Storable {
            private: true,
            chains: vec![StorableChain {
                name: "Work".to_string(),
                description: String::new(),
                salt: None,
                kdf: None,
                validator: None,
                links: vec![],
            }],
        };
        assert!(storable.validate().is_err());

        let storable = Storable {
            private: false,
            chains: vec![StorableChain {
                name: "Work".to_string(),
                description: String::new(),
                salt: None,
                kdf: None,
                validator: None,
                links: vec![StorableChainLink {
                    name: "x".to_string(),
                    description: String::new(),
                    password: "y".to_string(),
                    iv: Some("AA==".to_string()),
                }],
            }],
        };
        assert!(storable.validate().is_err());
    }

    #[test]
    fn test_import_private_rejects_unusable_key_material() {
        let service = service();
        let (doc, _) = sample(&service);
        let good = export(&service, &doc, &[], true, &mut keys(&[])).unwrap();

        let mut short_salt = good.clone();
        short_salt.chains[0].salt = Some(ChainCrypto::encode_salt(b"salt"));

        let mut no_memory = good.clone();
        no_memory.chains[0].kdf = Some(KdfParams {
            memory_kib: 0,
            iterations: 1,
            parallelism: 1,
        });

        for bad in [short_salt, no_memory] {
            let mut target = Keychain::new();
            let result = import(&service, &mut target, &bad, &mut keys(&[]));
            assert!(
                matches!(&result, Err(KeychainError::Storable { message, .. }) if message.contains("unusable key material")),
                "unexpected result {result:?}"
            );
            assert!(target.chains.is_empty());
            assert!(target.links.is_empty());
        }
    }
}
