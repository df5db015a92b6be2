//! Repository format metadata.
//!
//! The format is described by two blobs at the root of the storage:
//!
//! - `strongbox.repository` - unique id, required features, upgrade lock
//!   intent and the encrypted key material
//! - `strongbox.blobcfg` - blob retention settings
//!
//! [`FormatProvider`] is the read-only view the bootstrap and the upgrade
//! lock monitor consume; [`Manager`] implements it on top of a storage.

mod manager;
mod upgrade_lock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use blob::{BlobError, RetentionMode};

use crate::cache_keys::DerivationError;
use crate::feature::RequiredFeature;

pub use manager::{InitOptions, Manager, ManagerOptions, DEFAULT_FORMAT_BLOB_CACHE_DURATION};
pub use upgrade_lock::UpgradeLockIntent;

/// Blob holding the repository format.
pub const REPOSITORY_BLOB_ID: &str = "strongbox.repository";
/// Blob holding the blob storage configuration.
pub const BLOB_CFG_BLOB_ID: &str = "strongbox.blobcfg";

/// Prefixes of pack blobs.
pub const PACK_BLOB_PREFIXES: &[&str] = &["p", "q"];
/// Prefix of index blobs.
pub const INDEX_BLOB_PREFIX: &str = "n";
/// Prefix of epoch marker and uber-index blobs.
pub const EPOCH_BLOB_PREFIX: &str = "x";

/// Blob id prefixes written with retention when retention is enabled.
pub fn retention_protected_prefixes() -> Vec<String> {
    PACK_BLOB_PREFIXES
        .iter()
        .copied()
        .chain([
            INDEX_BLOB_PREFIX,
            EPOCH_BLOB_PREFIX,
            REPOSITORY_BLOB_ID,
            BLOB_CFG_BLOB_ID,
        ])
        .map(String::from)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("repository not initialized in the provided storage")]
    NotInitialized,

    #[error("repository already initialized in the provided storage")]
    AlreadyInitialized,

    #[error("invalid repository password")]
    InvalidPassword,

    #[error("malformed {blob} blob: {source}")]
    Malformed {
        blob: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("repository identity changed while connected")]
    IdentityChanged,

    #[error("invalid upgrade lock intent: {0}")]
    InvalidLockIntent(String),

    #[error("upgrade lock is held by {0:?}")]
    LockHeld(String),

    #[error("unsupported key derivation algorithm {0:?}")]
    UnsupportedKdf(String),

    #[error("unable to protect key material")]
    Encryption,

    #[error("unable to generate random bytes: {0}")]
    Random(getrandom::Error),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Storage(#[from] BlobError),
}

/// Identifies the last synchronised view of the format metadata. Advances
/// every time the metadata is re-read from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatRevision {
    generation: u64,
    loaded_at: DateTime<Utc>,
}

impl FormatRevision {
    pub fn new(generation: u64, loaded_at: DateTime<Utc>) -> Self {
        Self {
            generation,
            loaded_at,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl fmt::Display for FormatRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} loaded at {}", self.generation, self.loaded_at.to_rfc3339())
    }
}

/// Retention settings applied to protected blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobStorageConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_mode: Option<RetentionMode>,
    #[serde(
        default,
        with = "duration_secs::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub retention_period: Option<Duration>,
}

impl BlobStorageConfiguration {
    pub fn is_retention_enabled(&self) -> bool {
        self.retention_mode.is_some() && self.retention_period.is_some_and(|p| !p.is_zero())
    }
}

/// Format metadata the connection layer depends on.
#[async_trait]
pub trait FormatProvider: Send + Sync + fmt::Debug {
    async fn required_features(&self) -> Result<Vec<RequiredFeature>, FormatError>;

    /// The current lock intent, `None` when no upgrade is pending.
    async fn upgrade_lock_intent(&self) -> Result<Option<UpgradeLockIntent>, FormatError>;

    /// Current revision, re-reading the metadata first if the cached copy
    /// has expired.
    async fn revision(&self) -> Result<FormatRevision, FormatError>;

    /// Re-read the metadata now, regardless of cache age.
    async fn refresh(&self) -> Result<FormatRevision, FormatError>;

    async fn blob_cfg(&self) -> Result<BlobStorageConfiguration, FormatError>;

    fn supports_password_change(&self) -> bool;

    fn hmac_secret(&self) -> &[u8];

    fn format_encryption_key(&self) -> &[u8];

    fn unique_id(&self) -> &[u8];
}

/// Serde helpers storing durations as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
        }
    }
}
