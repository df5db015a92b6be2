//! The storage capability implemented by backends and every wrapper layer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, PutOptions};

/// Blob storage capability.
///
/// Wrappers implement this trait and delegate to an inner storage. A wrapper
/// never changes the logical result of a call: it only adds side effects
/// (metrics, delays, retention options, lock checks) or refuses the call.
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Store `data` under `id`.
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()>;

    /// Fetch the full contents of `id`.
    async fn get_blob(&self, id: &BlobId) -> Result<Bytes>;

    /// List every blob whose id starts with `prefix`, ordered by id.
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>>;

    /// Delete `id`. Deleting a missing blob is not an error.
    async fn delete_blob(&self, id: &BlobId) -> Result<()>;

    /// Release resources held by the storage.
    async fn close(&self) -> Result<()>;

    fn connection_info(&self) -> ConnectionInfo;

    fn display_name(&self) -> String;
}

/// Shared handle to a storage, the currency passed between layers.
pub type SharedStorage = Arc<dyn Storage>;
