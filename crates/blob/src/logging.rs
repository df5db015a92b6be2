//! Diagnostic wrapper that logs every storage call.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::storage::{SharedStorage, Storage};
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, PutOptions};

pub const DEFAULT_PREFIX: &str = "[STORAGE] ";

#[derive(Debug)]
pub struct TracingWrapper {
    inner: SharedStorage,
    prefix: String,
}

impl TracingWrapper {
    pub fn new(inner: SharedStorage, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Storage for TracingWrapper {
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()> {
        let start = Instant::now();
        let len = data.len();
        let retention = opts.retention_mode.map(|m| m.as_str());
        let result = self.inner.put_blob(id, data, opts).await;
        tracing::debug!(
            blob_id = %id,
            length = len,
            retention,
            duration = ?start.elapsed(),
            error = result.as_ref().err().map(tracing::field::display),
            "{}PutBlob",
            self.prefix
        );
        result
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.inner.get_blob(id).await;
        tracing::debug!(
            blob_id = %id,
            length = result.as_ref().ok().map(|b| b.len()),
            duration = ?start.elapsed(),
            error = result.as_ref().err().map(tracing::field::display),
            "{}GetBlob",
            self.prefix
        );
        result
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let start = Instant::now();
        let result = self.inner.list_blobs(prefix).await;
        tracing::debug!(
            prefix,
            count = result.as_ref().ok().map(|v| v.len()),
            duration = ?start.elapsed(),
            error = result.as_ref().err().map(tracing::field::display),
            "{}ListBlobs",
            self.prefix
        );
        result
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.delete_blob(id).await;
        tracing::debug!(
            blob_id = %id,
            duration = ?start.elapsed(),
            error = result.as_ref().err().map(tracing::field::display),
            "{}DeleteBlob",
            self.prefix
        );
        result
    }

    async fn close(&self) -> Result<()> {
        let result = self.inner.close().await;
        tracing::debug!(
            error = result.as_ref().err().map(tracing::field::display),
            "{}Close",
            self.prefix
        );
        result
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }
}
