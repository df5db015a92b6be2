//! Write-once retention tagging of protected blobs.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::storage::{SharedStorage, Storage};
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, PutOptions, RetentionMode};

/// Injects retention options into every put whose blob id starts with one
/// of the protected prefixes. Other calls pass through untouched.
#[derive(Debug)]
pub struct RetentionWrapper {
    inner: SharedStorage,
    mode: RetentionMode,
    period: Duration,
    prefixes: Vec<String>,
}

impl RetentionWrapper {
    pub fn new(
        inner: SharedStorage,
        mode: RetentionMode,
        period: Duration,
        prefixes: Vec<String>,
    ) -> Self {
        Self {
            inner,
            mode,
            period,
            prefixes,
        }
    }

    fn is_protected(&self, id: &BlobId) -> bool {
        self.prefixes.iter().any(|p| id.has_prefix(p))
    }
}

#[async_trait]
impl Storage for RetentionWrapper {
    async fn put_blob(&self, id: &BlobId, data: Bytes, mut opts: PutOptions) -> Result<()> {
        if self.is_protected(id) {
            opts.retention_mode = Some(self.mode);
            opts.retention_period = Some(self.period);
        }
        self.inner.put_blob(id, data, opts).await
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        self.inner.get_blob(id).await
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.inner.list_blobs(prefix).await
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        self.inner.delete_blob(id).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }
}
