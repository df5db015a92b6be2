//! Derivation of the secrets protecting the local cache.
//!
//! Two secrets are derived on every open and never persisted:
//!
//! - the **integrity secret** (16 bytes), HKDF-SHA256 over the repository
//!   master secret salted with the repository unique id
//! - the **encryption key** (32 bytes), scrypt over the password salted
//!   with `"content-cache-protection"` followed by the integrity secret
//!
//! Both are deterministic so a cache written by one process can be reused by
//! the next one that opens the same repository with the same password.

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::format::FormatProvider;

pub const LOCAL_CACHE_INTEGRITY_PURPOSE: &[u8] = b"local-cache-integrity";
pub const LOCAL_CACHE_INTEGRITY_SECRET_LEN: usize = 16;
pub const CONTENT_CACHE_PROTECTION_LABEL: &[u8] = b"content-cache-protection";
pub const CONTENT_CACHE_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    #[error("invalid scrypt parameters: {0}")]
    InvalidParams(String),
    #[error("invalid derived key length: {0}")]
    InvalidLength(usize),
    #[error("master key material is empty")]
    EmptyMasterKey,
    #[error("key derivation task failed: {0}")]
    Task(String),
}

/// scrypt cost parameters. `log_n` is log2 of N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScryptParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for ScryptParams {
    /// N=65536, r=8, p=1
    fn default() -> Self {
        Self {
            log_n: 16,
            r: 8,
            p: 1,
        }
    }
}

impl ScryptParams {
    fn params(&self, len: usize) -> Result<scrypt::Params, DerivationError> {
        scrypt::Params::new(self.log_n, self.r, self.p, len)
            .map_err(|e| DerivationError::InvalidParams(format!("{:?}: {}", self, e)))
    }

    pub fn validate(&self) -> Result<(), DerivationError> {
        self.params(CONTENT_CACHE_KEY_LEN).map(|_| ())
    }

    /// scrypt(`password`, `salt`) producing `len` bytes.
    pub fn derive(&self, password: &[u8], salt: &[u8], len: usize) -> Result<Vec<u8>, DerivationError> {
        if len == 0 {
            return Err(DerivationError::InvalidLength(len));
        }
        let params = self.params(len)?;
        let mut out = vec![0u8; len];
        scrypt::scrypt(password, salt, &params, &mut out)
            .map_err(|_| DerivationError::InvalidLength(len))?;
        Ok(out)
    }
}

/// HKDF-SHA256 with `master_key` as input key material, `unique_id` as salt
/// and `purpose` as info.
pub fn derive_key_from_master_key(
    master_key: &[u8],
    unique_id: &[u8],
    purpose: &[u8],
    len: usize,
) -> Result<Vec<u8>, DerivationError> {
    if master_key.is_empty() {
        return Err(DerivationError::EmptyMasterKey);
    }
    let hkdf = Hkdf::<Sha256>::new(Some(unique_id), master_key);
    let mut out = vec![0u8; len];
    hkdf.expand(purpose, &mut out)
        .map_err(|_| DerivationError::InvalidLength(len))?;
    Ok(out)
}

/// Integrity secret for the local cache of the repository described by
/// `format`.
///
/// Repositories without password-change support derive from the format
/// encryption key instead of the HMAC secret. Caches created by older
/// clients depend on this, so both branches must stay.
pub fn cache_integrity_secret(format: &dyn FormatProvider) -> Result<Vec<u8>, DerivationError> {
    let master = if format.supports_password_change() {
        format.hmac_secret()
    } else {
        format.format_encryption_key()
    };
    derive_key_from_master_key(
        master,
        format.unique_id(),
        LOCAL_CACHE_INTEGRITY_PURPOSE,
        LOCAL_CACHE_INTEGRITY_SECRET_LEN,
    )
}

/// Content cache encryption key derived from the password and the cache
/// integrity secret.
pub fn content_cache_key(
    password: &str,
    hmac_secret: &[u8],
    params: &ScryptParams,
) -> Result<Vec<u8>, DerivationError> {
    let mut salt = Vec::with_capacity(CONTENT_CACHE_PROTECTION_LABEL.len() + hmac_secret.len());
    salt.extend_from_slice(CONTENT_CACHE_PROTECTION_LABEL);
    salt.extend_from_slice(hmac_secret);
    params.derive(password.as_bytes(), &salt, CONTENT_CACHE_KEY_LEN)
}

/// Secrets protecting the local cache.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheSecrets {
    integrity: Vec<u8>,
    encryption: Vec<u8>,
}

impl fmt::Debug for CacheSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSecrets")
            .field("integrity", &"<redacted>")
            .field("encryption", &"<redacted>")
            .finish()
    }
}

impl CacheSecrets {
    pub fn derive(
        password: &str,
        format: &dyn FormatProvider,
        params: &ScryptParams,
    ) -> Result<Self, DerivationError> {
        let integrity = cache_integrity_secret(format)?;
        let encryption = content_cache_key(password, &integrity, params)?;
        Ok(Self {
            integrity,
            encryption,
        })
    }

    /// Same as [`CacheSecrets::derive`], run on the blocking pool since
    /// scrypt is deliberately expensive.
    pub async fn derive_blocking(
        password: &str,
        format: &dyn FormatProvider,
        params: ScryptParams,
    ) -> Result<Self, DerivationError> {
        let integrity = cache_integrity_secret(format)?;
        let password = password.to_string();
        let salt_secret = integrity.clone();
        let encryption =
            tokio::task::spawn_blocking(move || content_cache_key(&password, &salt_secret, &params))
                .await
                .map_err(|e| DerivationError::Task(e.to_string()))??;
        Ok(Self {
            integrity,
            encryption,
        })
    }

    pub fn integrity(&self) -> &[u8] {
        &self.integrity
    }

    pub fn encryption(&self) -> &[u8] {
        &self.encryption
    }
}
