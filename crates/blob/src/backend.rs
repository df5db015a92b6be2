//! Base storage over the `object_store` crate (S3/MinIO/local filesystem/memory).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, TagSet};
use serde::{Deserialize, Serialize};

use crate::error::{BlobError, Result};
use crate::storage::Storage;
use crate::throttling::Limits;
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, PutOptions};

/// Every blob lives under this directory of the object store.
const BLOBS_DIR: &str = "blobs";

/// Object tag carrying the retention mode of a protected blob.
pub const RETENTION_MODE_TAG: &str = "strongbox-retention-mode";
/// Object tag carrying the retention period (seconds) of a protected blob.
pub const RETENTION_PERIOD_TAG: &str = "strongbox-retention-period";

/// Configuration for the object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local filesystem storage
    Filesystem {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        /// S3 endpoint URL (e.g., "http://localhost:9000" for MinIO)
        endpoint: String,
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Bucket name
        bucket: String,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
    },
}

impl ObjectStoreConfig {
    fn kind(&self) -> &'static str {
        match self {
            ObjectStoreConfig::Memory => "memory",
            ObjectStoreConfig::Filesystem { .. } => "filesystem",
            ObjectStoreConfig::S3 { .. } => "s3",
        }
    }
}

/// Storage section of a connection config: the backend plus the
/// throttling limits the backend advertises to clients.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub backend: ObjectStoreConfig,
    #[serde(flatten)]
    pub limits: Limits,
}

impl From<ObjectStoreConfig> for StorageConfig {
    fn from(backend: ObjectStoreConfig) -> Self {
        Self {
            backend,
            limits: Limits::default(),
        }
    }
}

/// [`Storage`] implementation backed by an `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreStorage {
    inner: Arc<dyn ObjectStore>,
    config: StorageConfig,
}

impl ObjectStoreStorage {
    /// Create a new storage backend from configuration.
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match &config.backend {
            ObjectStoreConfig::Memory => Arc::new(InMemory::new()),

            ObjectStoreConfig::Filesystem { path } => {
                let path = &expand_home(path)?;
                if !path.is_absolute() {
                    return Err(BlobError::InvalidConfig(format!(
                        "filesystem path must be absolute: {}",
                        path.display()
                    )));
                }
                tokio::fs::create_dir_all(path).await?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(path)
                        .map_err(|e| BlobError::InvalidConfig(e.to_string()))?,
                )
            }

            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"));

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| BlobError::InvalidConfig(e.to_string()))?,
                );

                // Fail fast if the bucket doesn't exist
                let prefix = ObjectPath::from(BLOBS_DIR);
                let first = store.list(Some(&prefix)).try_next().await;
                match first {
                    Ok(_) => {}
                    Err(object_store::Error::NotFound { .. }) => {
                        return Err(BlobError::BucketNotFound(bucket.clone()));
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("NoSuchBucket") {
                            return Err(BlobError::BucketNotFound(bucket.clone()));
                        }
                        return Err(BlobError::backend("ListBlobs", "", e));
                    }
                }

                store
            }
        };

        tracing::debug!(kind = config.backend.kind(), "object storage opened");
        Ok(Self { inner, config })
    }

    /// Create an in-memory storage backend.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            config: StorageConfig::default(),
        }
    }

    /// Replace the throttling limits advertised through connection info.
    pub fn with_advertised_limits(mut self, limits: Limits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Build the object path for a blob.
    fn blob_path(id: &BlobId) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", BLOBS_DIR, id))
    }

    /// Only S3 understands object tags; other backends would refuse them.
    fn supports_tags(&self) -> bool {
        matches!(self.config.backend, ObjectStoreConfig::S3 { .. })
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()> {
        let path = Self::blob_path(id);
        let mut put_opts = object_store::PutOptions::default();

        if opts.has_retention() {
            if self.supports_tags() {
                let mut tags = TagSet::default();
                if let Some(mode) = opts.retention_mode {
                    tags.push(RETENTION_MODE_TAG, mode.as_str());
                }
                if let Some(period) = opts.retention_period {
                    tags.push(RETENTION_PERIOD_TAG, &period.as_secs().to_string());
                }
                put_opts.tags = tags;
            } else {
                tracing::trace!(blob_id = %id, "backend cannot enforce retention, storing without it");
            }
        }

        self.inner
            .put_opts(&path, data.into(), put_opts)
            .await
            .map_err(|e| BlobError::backend("PutBlob", id.as_str(), e))?;
        Ok(())
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        let path = Self::blob_path(id);
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| BlobError::backend("GetBlob", id.as_str(), e))?;
        result
            .bytes()
            .await
            .map_err(|e| BlobError::backend("GetBlob", id.as_str(), e))
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let dir = ObjectPath::from(BLOBS_DIR);
        let items: Vec<_> = self
            .inner
            .list(Some(&dir))
            .try_collect()
            .await
            .map_err(|e| BlobError::backend("ListBlobs", prefix, e))?;

        let strip = format!("{}/", BLOBS_DIR);
        let mut blobs: Vec<BlobMetadata> = items
            .into_iter()
            .filter_map(|meta| {
                let id = meta.location.as_ref().strip_prefix(&strip)?;
                if !id.starts_with(prefix) {
                    return None;
                }
                Some(BlobMetadata {
                    id: BlobId::from(id),
                    length: meta.size as u64,
                    timestamp: meta.last_modified,
                })
            })
            .collect();
        blobs.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(blobs)
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        let path = Self::blob_path(id);
        // Ignore NotFound errors - the blob may already be deleted
        match self.inner.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(BlobError::backend("DeleteBlob", id.as_str(), e)),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            kind: self.config.backend.kind().to_string(),
            config: serde_json::to_value(&self.config).unwrap_or_default(),
        }
    }

    fn display_name(&self) -> String {
        match &self.config.backend {
            ObjectStoreConfig::Memory => "In-Memory Storage".to_string(),
            ObjectStoreConfig::Filesystem { path } => format!("Filesystem: {}", path.display()),
            ObjectStoreConfig::S3 {
                endpoint, bucket, ..
            } => format!("S3: {} {}", endpoint, bucket),
        }
    }
}

/// Replace a leading `~` with the home directory.
fn expand_home(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir().ok_or_else(|| {
        BlobError::InvalidConfig(format!(
            "cannot expand {}: home directory unknown",
            path.display()
        ))
    })?;
    Ok(home.join(rest))
}
