//! Protection of entries written to the local cache.
//!
//! Metadata entries are signed with HMAC-SHA256 under the cache integrity
//! secret. Content entries are encrypted with ChaCha20-Poly1305 under the
//! content cache key, with the cache entry id bound as associated data.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::cache_keys::CacheSecrets;

type HmacSha256 = Hmac<Sha256>;

/// Size of an HMAC-SHA256 tag in bytes
pub const HMAC_TAG_SIZE: usize = 32;
/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ProtectionError {
    #[error("cache entry {0} is too short")]
    Truncated(String),
    #[error("cache entry {0} failed verification")]
    Invalid(String),
    #[error("invalid protection key length {0}")]
    InvalidKey(usize),
    #[error("unable to generate nonce: {0}")]
    Random(getrandom::Error),
}

/// Protects cache entries against tampering (and optionally disclosure).
pub trait StorageProtection: Send + Sync + std::fmt::Debug {
    /// Protected form of `data`, stored under `id`.
    fn protect(&self, id: &str, data: &[u8]) -> Result<Vec<u8>, ProtectionError>;

    /// Original data from a protected entry, or an error if it was altered.
    fn verify(&self, id: &str, protected: &[u8]) -> Result<Vec<u8>, ProtectionError>;
}

/// Appends an HMAC-SHA256 tag over `id || data`.
pub struct HmacProtection {
    secret: Vec<u8>,
}

impl std::fmt::Debug for HmacProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacProtection")
    }
}

impl HmacProtection {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self, id: &str, data: &[u8]) -> Result<HmacSha256, ProtectionError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|_| ProtectionError::InvalidKey(self.secret.len()))?;
        mac.update(id.as_bytes());
        mac.update(data);
        Ok(mac)
    }
}

impl StorageProtection for HmacProtection {
    fn protect(&self, id: &str, data: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        let tag = self.mac(id, data)?.finalize().into_bytes();
        let mut out = Vec::with_capacity(data.len() + HMAC_TAG_SIZE);
        out.extend_from_slice(data);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn verify(&self, id: &str, protected: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        if protected.len() < HMAC_TAG_SIZE {
            return Err(ProtectionError::Truncated(id.to_string()));
        }
        let (data, tag) = protected.split_at(protected.len() - HMAC_TAG_SIZE);
        self.mac(id, data)?
            .verify_slice(tag)
            .map_err(|_| ProtectionError::Invalid(id.to_string()))?;
        Ok(data.to_vec())
    }
}

/// ChaCha20-Poly1305 encryption, output is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
pub struct AuthenticatedEncryption {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for AuthenticatedEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthenticatedEncryption")
    }
}

impl AuthenticatedEncryption {
    pub fn new(key: &[u8]) -> Result<Self, ProtectionError> {
        if key.len() != KEY_SIZE {
            return Err(ProtectionError::InvalidKey(key.len()));
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }
}

impl StorageProtection for AuthenticatedEncryption {
    fn protect(&self, id: &str, data: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(ProtectionError::Random)?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: data,
                    aad: id.as_bytes(),
                },
            )
            .map_err(|_| ProtectionError::Invalid(id.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn verify(&self, id: &str, protected: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        if protected.len() < NONCE_SIZE {
            return Err(ProtectionError::Truncated(id.to_string()));
        }
        let (nonce, ciphertext) = protected.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: id.as_bytes(),
                },
            )
            .map_err(|_| ProtectionError::Invalid(id.to_string()))
    }
}

/// Protection for metadata entries (integrity only).
pub fn metadata_protection(secrets: &CacheSecrets) -> HmacProtection {
    HmacProtection::new(secrets.integrity())
}

/// Protection for content entries (encrypted and authenticated).
pub fn content_protection(secrets: &CacheSecrets) -> Result<AuthenticatedEncryption, ProtectionError> {
    AuthenticatedEncryption::new(secrets.encryption())
}
