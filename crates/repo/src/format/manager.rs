//! Storage-backed format metadata.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use blob::{BlobError, BlobId, PutOptions, SharedStorage, Storage};

use super::{
    BlobStorageConfiguration, FormatError, FormatProvider, FormatRevision, UpgradeLockIntent,
    BLOB_CFG_BLOB_ID, REPOSITORY_BLOB_ID,
};
use crate::cache_keys::ScryptParams;
use crate::cache_protection::{AuthenticatedEncryption, StorageProtection};
use crate::feature::{RequiredFeature, SUPPORTED_FEATURES};
use crate::options::{system_time, TimeNow};

/// How long a loaded format is trusted before it is re-read.
pub const DEFAULT_FORMAT_BLOB_CACHE_DURATION: Duration = Duration::from_secs(15 * 60);

const FORMAT_VERSION: u32 = 1;
const KDF_SCRYPT: &str = "scrypt";
const SECRET_LEN: usize = 32;
const FORMAT_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDerivation {
    algorithm: String,
    #[serde(flatten)]
    params: ScryptParams,
}

/// Contents of the repository blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryBlob {
    unique_id: String,
    format_version: u32,
    #[serde(default)]
    required_features: Vec<RequiredFeature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upgrade_lock: Option<UpgradeLockIntent>,
    #[serde(default)]
    supports_password_change: bool,
    key_derivation: KeyDerivation,
    encrypted_keys: String,
}

/// Secrets stored encrypted inside the repository blob.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyMaterial {
    hmac_secret: String,
    master_key: String,
}

#[derive(Clone)]
pub struct ManagerOptions {
    pub cache_duration: Duration,
    pub time_now: TimeNow,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            cache_duration: DEFAULT_FORMAT_BLOB_CACHE_DURATION,
            time_now: system_time(),
        }
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("cache_duration", &self.cache_duration)
            .finish_non_exhaustive()
    }
}

/// Parameters of a new repository.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub required_features: Vec<RequiredFeature>,
    pub supports_password_change: bool,
    pub kdf: ScryptParams,
    pub blob_cfg: BlobStorageConfiguration,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            required_features: SUPPORTED_FEATURES
                .iter()
                .map(|f| RequiredFeature::new(*f))
                .collect(),
            supports_password_change: true,
            kdf: ScryptParams::default(),
            blob_cfg: BlobStorageConfiguration::default(),
        }
    }
}

struct Loaded {
    repo: RepositoryBlob,
    blob_cfg: BlobStorageConfiguration,
    revision: FormatRevision,
}

/// Loads, caches and updates the format blobs of a repository.
pub struct Manager {
    storage: SharedStorage,
    options: ManagerOptions,
    unique_id: Vec<u8>,
    supports_password_change: bool,
    format_encryption_key: Vec<u8>,
    hmac_secret: Vec<u8>,
    master_key: Vec<u8>,
    state: RwLock<Loaded>,
    refresh: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("storage", &self.storage.display_name())
            .field("unique_id", &hex::encode(&self.unique_id))
            .field("revision", &self.state.read().revision)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Write the format blobs of a new repository into `storage`.
    pub async fn initialize(
        storage: &dyn Storage,
        password: &str,
        opts: InitOptions,
    ) -> Result<(), FormatError> {
        match storage.get_blob(&BlobId::from(REPOSITORY_BLOB_ID)).await {
            Ok(_) => return Err(FormatError::AlreadyInitialized),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let unique_id = random_bytes(SECRET_LEN)?;
        let keys = KeyMaterial {
            hmac_secret: hex::encode(random_bytes(SECRET_LEN)?),
            master_key: hex::encode(random_bytes(SECRET_LEN)?),
        };

        let format_key = derive_format_key(password, &unique_id, opts.kdf).await?;
        let plaintext = serde_json::to_vec(&keys).map_err(|_| FormatError::Encryption)?;
        let encrypted = AuthenticatedEncryption::new(&format_key)
            .and_then(|aead| aead.protect(REPOSITORY_BLOB_ID, &plaintext))
            .map_err(|_| FormatError::Encryption)?;

        let repo = RepositoryBlob {
            unique_id: hex::encode(&unique_id),
            format_version: FORMAT_VERSION,
            required_features: opts.required_features,
            upgrade_lock: None,
            supports_password_change: opts.supports_password_change,
            key_derivation: KeyDerivation {
                algorithm: KDF_SCRYPT.to_string(),
                params: opts.kdf,
            },
            encrypted_keys: hex::encode(encrypted),
        };

        // blob configuration first, so a visible repository blob implies a
        // complete format
        put_json(storage, BLOB_CFG_BLOB_ID, &opts.blob_cfg).await?;
        put_json(storage, REPOSITORY_BLOB_ID, &repo).await?;

        tracing::info!(
            unique_id = %repo.unique_id,
            storage = %storage.display_name(),
            "repository initialized"
        );
        Ok(())
    }

    /// Load the format of the repository in `storage`, unlocking its key
    /// material with `password`.
    pub async fn open(
        storage: SharedStorage,
        password: &str,
        options: ManagerOptions,
    ) -> Result<Self, FormatError> {
        let repo = fetch_repository_blob(storage.as_ref()).await?;
        let blob_cfg = fetch_blob_cfg(storage.as_ref()).await?;

        if repo.key_derivation.algorithm != KDF_SCRYPT {
            return Err(FormatError::UnsupportedKdf(repo.key_derivation.algorithm.clone()));
        }
        let unique_id = decode_hex(&repo.unique_id)?;
        let format_key = derive_format_key(password, &unique_id, repo.key_derivation.params).await?;

        let encrypted = decode_hex(&repo.encrypted_keys)?;
        let plaintext = AuthenticatedEncryption::new(&format_key)
            .and_then(|aead| aead.verify(REPOSITORY_BLOB_ID, &encrypted))
            .map_err(|_| FormatError::InvalidPassword)?;
        let keys: KeyMaterial =
            serde_json::from_slice(&plaintext).map_err(|source| FormatError::Malformed {
                blob: REPOSITORY_BLOB_ID,
                source,
            })?;

        let revision = FormatRevision::new(1, (options.time_now)());
        tracing::debug!(unique_id = %repo.unique_id, %revision, "format loaded");

        Ok(Self {
            unique_id,
            supports_password_change: repo.supports_password_change,
            format_encryption_key: format_key,
            hmac_secret: decode_hex(&keys.hmac_secret)?,
            master_key: decode_hex(&keys.master_key)?,
            state: RwLock::new(Loaded {
                repo,
                blob_cfg,
                revision,
            }),
            refresh: tokio::sync::Mutex::new(()),
            storage,
            options,
        })
    }

    /// Revision currently cached, without checking for expiry.
    pub fn loaded_revision(&self) -> FormatRevision {
        self.state.read().revision
    }

    /// Master key protecting repository content.
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    pub fn cache_duration(&self) -> Duration {
        self.options.cache_duration
    }

    fn is_stale(&self, revision: FormatRevision) -> bool {
        let age = (self.options.time_now)() - revision.loaded_at();
        age.to_std()
            .map(|age| age >= self.options.cache_duration)
            .unwrap_or(false)
    }

    /// Re-read the format if the cached copy has expired. Concurrent
    /// callers share a single re-read.
    async fn maybe_refresh(&self) -> Result<FormatRevision, FormatError> {
        let revision = self.loaded_revision();
        if !self.is_stale(revision) {
            return Ok(revision);
        }

        let _guard = self.refresh.lock().await;
        let revision = self.loaded_revision();
        if !self.is_stale(revision) {
            return Ok(revision);
        }
        self.reload_locked().await
    }

    /// Re-read the format now.
    pub async fn refresh(&self) -> Result<FormatRevision, FormatError> {
        let _guard = self.refresh.lock().await;
        self.reload_locked().await
    }

    /// Caller must hold `self.refresh`.
    async fn reload_locked(&self) -> Result<FormatRevision, FormatError> {
        let repo = fetch_repository_blob(self.storage.as_ref()).await?;
        let blob_cfg = fetch_blob_cfg(self.storage.as_ref()).await?;

        if decode_hex(&repo.unique_id)? != self.unique_id {
            return Err(FormatError::IdentityChanged);
        }

        let mut state = self.state.write();
        let revision = FormatRevision::new(state.revision.generation() + 1, (self.options.time_now)());
        *state = Loaded {
            repo,
            blob_cfg,
            revision,
        };
        tracing::debug!(%revision, "format reloaded");
        Ok(revision)
    }

    /// Apply `update` to the latest repository blob, write it back and
    /// reload.
    async fn update_repository_blob<F>(&self, update: F) -> Result<FormatRevision, FormatError>
    where
        F: FnOnce(&mut RepositoryBlob) -> Result<bool, FormatError>,
    {
        let _guard = self.refresh.lock().await;
        let mut repo = fetch_repository_blob(self.storage.as_ref()).await?;
        if update(&mut repo)? {
            put_json(self.storage.as_ref(), REPOSITORY_BLOB_ID, &repo).await?;
        }
        self.reload_locked().await
    }

    /// Take the upgrade lock. Taking a lock already held by the same owner
    /// returns the existing intent.
    pub async fn set_upgrade_lock_intent(
        &self,
        intent: UpgradeLockIntent,
    ) -> Result<UpgradeLockIntent, FormatError> {
        intent.validate()?;
        let mut effective = intent.clone();
        self.update_repository_blob(|repo| match &repo.upgrade_lock {
            Some(existing) if existing.owner_id != intent.owner_id => {
                Err(FormatError::LockHeld(existing.owner_id.clone()))
            }
            Some(existing) => {
                effective = existing.clone();
                Ok(false)
            }
            None => {
                repo.upgrade_lock = Some(intent);
                Ok(true)
            }
        })
        .await?;

        tracing::info!(owner = %effective.owner_id, "upgrade lock taken");
        Ok(effective)
    }

    /// Release the upgrade lock held by `owner_id`.
    pub async fn clear_upgrade_lock_intent(&self, owner_id: &str) -> Result<(), FormatError> {
        self.update_repository_blob(|repo| match &repo.upgrade_lock {
            None => Ok(false),
            Some(existing) if existing.owner_id != owner_id => {
                Err(FormatError::LockHeld(existing.owner_id.clone()))
            }
            Some(_) => {
                repo.upgrade_lock = None;
                Ok(true)
            }
        })
        .await?;

        tracing::info!(owner = owner_id, "upgrade lock released");
        Ok(())
    }

    /// Replace the features clients must support to open the repository.
    pub async fn set_required_features(
        &self,
        features: Vec<RequiredFeature>,
    ) -> Result<(), FormatError> {
        self.update_repository_blob(|repo| {
            repo.required_features = features;
            Ok(true)
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl FormatProvider for Manager {
    async fn required_features(&self) -> Result<Vec<RequiredFeature>, FormatError> {
        self.maybe_refresh().await?;
        Ok(self.state.read().repo.required_features.clone())
    }

    async fn upgrade_lock_intent(&self) -> Result<Option<UpgradeLockIntent>, FormatError> {
        self.maybe_refresh().await?;
        Ok(self.state.read().repo.upgrade_lock.clone())
    }

    async fn revision(&self) -> Result<FormatRevision, FormatError> {
        self.maybe_refresh().await
    }

    async fn refresh(&self) -> Result<FormatRevision, FormatError> {
        Manager::refresh(self).await
    }

    async fn blob_cfg(&self) -> Result<BlobStorageConfiguration, FormatError> {
        self.maybe_refresh().await?;
        Ok(self.state.read().blob_cfg.clone())
    }

    fn supports_password_change(&self) -> bool {
        self.supports_password_change
    }

    fn hmac_secret(&self) -> &[u8] {
        &self.hmac_secret
    }

    fn format_encryption_key(&self) -> &[u8] {
        &self.format_encryption_key
    }

    fn unique_id(&self) -> &[u8] {
        &self.unique_id
    }
}

async fn derive_format_key(
    password: &str,
    unique_id: &[u8],
    params: ScryptParams,
) -> Result<Vec<u8>, FormatError> {
    let password = password.to_string();
    let salt = unique_id.to_vec();
    let key = tokio::task::spawn_blocking(move || {
        params.derive(password.as_bytes(), &salt, FORMAT_KEY_LEN)
    })
    .await
    .map_err(|e| crate::cache_keys::DerivationError::Task(e.to_string()))??;
    Ok(key)
}

async fn fetch_repository_blob(storage: &dyn Storage) -> Result<RepositoryBlob, FormatError> {
    let data = match storage.get_blob(&BlobId::from(REPOSITORY_BLOB_ID)).await {
        Ok(data) => data,
        Err(BlobError::NotFound(_)) => return Err(FormatError::NotInitialized),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map_err(|source| FormatError::Malformed {
        blob: REPOSITORY_BLOB_ID,
        source,
    })
}

/// A missing blob configuration means retention is disabled.
async fn fetch_blob_cfg(storage: &dyn Storage) -> Result<BlobStorageConfiguration, FormatError> {
    match storage.get_blob(&BlobId::from(BLOB_CFG_BLOB_ID)).await {
        Ok(data) => serde_json::from_slice(&data).map_err(|source| FormatError::Malformed {
            blob: BLOB_CFG_BLOB_ID,
            source,
        }),
        Err(BlobError::NotFound(_)) => Ok(BlobStorageConfiguration::default()),
        Err(e) => Err(e.into()),
    }
}

async fn put_json<T: Serialize>(
    storage: &dyn Storage,
    id: &'static str,
    value: &T,
) -> Result<(), FormatError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|source| FormatError::Malformed { blob: id, source })?;
    storage
        .put_blob(&BlobId::from(id), Bytes::from(data), PutOptions::default())
        .await?;
    Ok(())
}

fn random_bytes(len: usize) -> Result<Vec<u8>, FormatError> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(FormatError::Random)?;
    Ok(buf)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, FormatError> {
    hex::decode(s).map_err(|e| FormatError::Malformed {
        blob: REPOSITORY_BLOB_ID,
        source: serde::de::Error::custom(e),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blob::testkit::RecordingStorage;
    use blob::Operation;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    use super::*;

    const CHEAP: ScryptParams = ScryptParams {
        log_n: 4,
        r: 8,
        p: 1,
    };

    fn init_opts() -> InitOptions {
        InitOptions {
            kdf: CHEAP,
            ..Default::default()
        }
    }

    fn clock() -> (Arc<Mutex<DateTime<Utc>>>, TimeNow) {
        let now = Arc::new(Mutex::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let handle = now.clone();
        (now, Arc::new(move || *handle.lock()))
    }

    #[tokio::test]
    async fn test_initialize_then_open() {
        let st = Arc::new(RecordingStorage::new());
        Manager::initialize(st.as_ref(), "pass", init_opts()).await.unwrap();

        let m = Manager::open(st.clone(), "pass", ManagerOptions::default())
            .await
            .unwrap();
        assert_eq!(m.unique_id().len(), 32);
        assert_eq!(m.hmac_secret().len(), 32);
        assert_eq!(m.master_key().len(), 32);
        assert!(m.supports_password_change());
        assert_eq!(m.required_features().await.unwrap().len(), 2);
        assert!(m.upgrade_lock_intent().await.unwrap().is_none());
        assert!(!m.blob_cfg().await.unwrap().is_retention_enabled());

        // same password, same key material
        let m2 = Manager::open(st.clone(), "pass", ManagerOptions::default())
            .await
            .unwrap();
        assert_eq!(m.hmac_secret(), m2.hmac_secret());
        assert_eq!(m.format_encryption_key(), m2.format_encryption_key());
    }

    #[tokio::test]
    async fn test_initialize_twice_and_wrong_password() {
        let st = Arc::new(RecordingStorage::new());
        Manager::initialize(st.as_ref(), "pass", init_opts()).await.unwrap();
        assert!(matches!(
            Manager::initialize(st.as_ref(), "pass", init_opts()).await,
            Err(FormatError::AlreadyInitialized)
        ));
        assert!(matches!(
            Manager::open(st.clone(), "wrong", ManagerOptions::default()).await,
            Err(FormatError::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn test_open_uninitialized() {
        let st = Arc::new(RecordingStorage::new());
        assert!(matches!(
            Manager::open(st, "pass", ManagerOptions::default()).await,
            Err(FormatError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_cache_expiry_advances_revision_once() {
        let st = Arc::new(RecordingStorage::new());
        Manager::initialize(st.as_ref(), "pass", init_opts()).await.unwrap();
        let (now, time_now) = clock();
        let m = Manager::open(
            st.clone(),
            "pass",
            ManagerOptions {
                cache_duration: Duration::from_secs(60),
                time_now,
            },
        )
        .await
        .unwrap();

        let first = m.revision().await.unwrap();
        let gets = st.count(Operation::Get);
        assert_eq!(m.revision().await.unwrap(), first);
        assert_eq!(st.count(Operation::Get), gets);

        *now.lock() += chrono::Duration::seconds(61);
        let second = m.revision().await.unwrap();
        assert!(second > first);
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(m.revision().await.unwrap(), second);
        // repository blob and blob configuration, read once
        assert_eq!(st.count(Operation::Get), gets + 2);
    }

    #[tokio::test]
    async fn test_upgrade_lock_take_and_release() {
        let st = Arc::new(RecordingStorage::new());
        Manager::initialize(st.as_ref(), "pass", init_opts()).await.unwrap();
        let alice = Manager::open(st.clone(), "pass", ManagerOptions::default())
            .await
            .unwrap();
        let bob = Manager::open(st.clone(), "pass", ManagerOptions::default())
            .await
            .unwrap();

        let before = alice.loaded_revision();
        let intent = UpgradeLockIntent::new("alice", Utc::now());
        alice.set_upgrade_lock_intent(intent.clone()).await.unwrap();
        assert!(alice.loaded_revision() > before);
        assert_eq!(alice.upgrade_lock_intent().await.unwrap(), Some(intent.clone()));

        // bob still sees his cached copy until he refreshes
        assert!(bob.upgrade_lock_intent().await.unwrap().is_none());
        bob.refresh().await.unwrap();
        assert_eq!(bob.upgrade_lock_intent().await.unwrap(), Some(intent));

        assert!(matches!(
            bob.set_upgrade_lock_intent(UpgradeLockIntent::new("bob", Utc::now())).await,
            Err(FormatError::LockHeld(owner)) if owner == "alice"
        ));
        assert!(matches!(
            bob.clear_upgrade_lock_intent("bob").await,
            Err(FormatError::LockHeld(_))
        ));

        alice.clear_upgrade_lock_intent("alice").await.unwrap();
        assert!(alice.upgrade_lock_intent().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_repository_flag_round_trips() {
        let st = Arc::new(RecordingStorage::new());
        let opts = InitOptions {
            supports_password_change: false,
            ..init_opts()
        };
        Manager::initialize(st.as_ref(), "pass", opts).await.unwrap();
        let m = Manager::open(st, "pass", ManagerOptions::default()).await.unwrap();
        assert!(!m.supports_password_change());
        assert_ne!(m.format_encryption_key(), m.hmac_secret());
    }
}
