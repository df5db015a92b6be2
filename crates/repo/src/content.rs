//! State shared by every handle and session of an open repository.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blob::metrics::MetricsRegistry;
use blob::{BlobError, SharedStorage};

use crate::cache_keys::CacheSecrets;
use crate::cache_protection::{
    content_protection, metadata_protection, AuthenticatedEncryption, HmacProtection,
    StorageProtection,
};
use crate::config::CachingOptions;
use crate::error::Result;
use crate::format::FormatProvider;

/// Storage, cache protection and metrics shared across sessions.
#[derive(Debug)]
pub struct SharedManager {
    storage: SharedStorage,
    format: Arc<dyn FormatProvider>,
    caching: CachingOptions,
    metadata_protection: HmacProtection,
    content_protection: AuthenticatedEncryption,
    metrics: Arc<MetricsRegistry>,
    closed: AtomicBool,
}

impl SharedManager {
    pub fn new(
        storage: SharedStorage,
        format: Arc<dyn FormatProvider>,
        caching: CachingOptions,
        secrets: &CacheSecrets,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            metadata_protection: metadata_protection(secrets),
            content_protection: content_protection(secrets)?,
            storage,
            format,
            caching,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Fully wrapped storage.
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn format(&self) -> &Arc<dyn FormatProvider> {
        &self.format
    }

    pub fn caching(&self) -> &CachingOptions {
        &self.caching
    }

    /// Integrity protection for cached metadata.
    pub fn metadata_protection(&self) -> &dyn StorageProtection {
        &self.metadata_protection
    }

    /// Encryption for cached content.
    pub fn content_protection(&self) -> &dyn StorageProtection {
        &self.content_protection
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the underlying storage. Only the first call has any effect.
    pub async fn close_shared(&self) -> std::result::Result<(), BlobError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(storage = %self.storage.display_name(), "closing shared storage");
        self.storage.close().await
    }
}
