//! Chain key derivation (Argon2id) and link password encryption (AES-256-GCM).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::{password_hash::rand_core::RngCore, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Marker encrypted into every chain's validator.
const VALIDATOR_MARKER: &str = "keychain:chain-key-check:v1";

/// Errors that can occur during cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid base64 encoding")]
    InvalidBase64,
    #[error("Invalid salt length")]
    InvalidSaltLength,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Argon2id cost parameters, stored alongside each chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536, // 64 MB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// A password encrypted under a chain's secret key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPassword {
    /// Base64 ciphertext with the GCM tag appended
    pub ciphertext: String,
    /// Base64 initialization vector
    pub iv: String,
}

/// Handles all cryptographic operations for chains and links.
pub struct ChainCrypto {
    key_len: usize,
    salt_len: usize,
    iv_len: usize,
}

impl Default for ChainCrypto {
    fn default() -> Self {
        Self {
            key_len: 32, // 256 bits for AES-256
            salt_len: 16,
            iv_len: 12, // 96 bits (GCM standard)
        }
    }
}

impl ChainCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new random salt.
    pub fn generate_salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; self.salt_len];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Encode salt as base64 for storage.
    pub fn encode_salt(salt: &[u8]) -> String {
        STANDARD.encode(salt)
    }

    /// Decode salt from base64.
    pub fn decode_salt(salt_b64: &str) -> Result<Vec<u8>, CryptoError> {
        STANDARD
            .decode(salt_b64)
            .map_err(|_| CryptoError::InvalidBase64)
    }

    /// Derive a chain's secret key from the user key using Argon2id.
    pub fn derive_key(
        &self,
        key: &str,
        salt: &[u8],
        kdf: &KdfParams,
    ) -> Result<SecretKey, CryptoError> {
        if salt.len() != self.salt_len {
            return Err(CryptoError::InvalidSaltLength);
        }

        let params = self.argon2_params(kdf)?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

        let mut output = vec![0u8; self.key_len];
        argon2
            .hash_password_into(key.as_bytes(), salt, &mut output)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        Ok(SecretKey(output))
    }

    /// Check that a stored salt and KDF parameters can derive a key at all.
    pub fn check_key_params(&self, salt_b64: &str, kdf: &KdfParams) -> Result<(), CryptoError> {
        if Self::decode_salt(salt_b64)?.len() != self.salt_len {
            return Err(CryptoError::InvalidSaltLength);
        }
        self.argon2_params(kdf).map(|_| ())
    }

    fn argon2_params(&self, kdf: &KdfParams) -> Result<Params, CryptoError> {
        Params::new(
            kdf.memory_kib,
            kdf.iterations,
            kdf.parallelism,
            Some(self.key_len),
        )
        .map_err(|_| CryptoError::KeyDerivationFailed)
    }

    /// Encrypt a password with a fresh random IV.
    pub fn encrypt(
        &self,
        plaintext: &str,
        key: &SecretKey,
    ) -> Result<EncryptedPassword, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedPassword {
            ciphertext: STANDARD.encode(&ciphertext),
            iv: STANDARD.encode(nonce),
        })
    }

    /// Decrypt a password. Any failure, including a wrong key, reports
    /// `DecryptionFailed`.
    pub fn decrypt(
        &self,
        encrypted: &EncryptedPassword,
        key: &SecretKey,
    ) -> Result<Zeroizing<String>, CryptoError> {
        let ciphertext = STANDARD
            .decode(&encrypted.ciphertext)
            .map_err(|_| CryptoError::InvalidBase64)?;
        let iv = STANDARD
            .decode(&encrypted.iv)
            .map_err(|_| CryptoError::InvalidBase64)?;

        if iv.len() != self.iv_len {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        let plaintext_bytes = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext_bytes)
            .map(Zeroizing::new)
            .map_err(|e| {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                CryptoError::DecryptionFailed
            })
    }

    /// Encrypt the fixed marker used to check a chain key.
    pub fn create_validator(&self, key: &SecretKey) -> Result<EncryptedPassword, CryptoError> {
        self.encrypt(VALIDATOR_MARKER, key)
    }

    /// Check a secret key against a chain's validator.
    pub fn verify_validator(&self, validator: &EncryptedPassword, key: &SecretKey) -> bool {
        matches!(self.decrypt(validator, key), Ok(marker) if marker.as_str() == VALIDATOR_MARKER)
    }
}

/// A derived chain key that automatically zeroes itself on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    /// Get a reference to the key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}
