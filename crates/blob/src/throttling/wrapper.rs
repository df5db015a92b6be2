use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{BucketKind, ThrottleMode, Throttler};
use crate::error::{BlobError, Result};
use crate::storage::{SharedStorage, Storage};
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, Operation, PutOptions};

/// Storage wrapper that charges every call against a [`Throttler`].
///
/// Downloaded bytes are charged after the fetch completes, since their
/// size isn't known upfront; that charge always waits regardless of mode.
#[derive(Debug)]
pub struct ThrottlingWrapper {
    inner: SharedStorage,
    throttler: Arc<Throttler>,
    mode: ThrottleMode,
    cancel: CancellationToken,
}

impl ThrottlingWrapper {
    pub fn new(
        inner: SharedStorage,
        throttler: Arc<Throttler>,
        mode: ThrottleMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            throttler,
            mode,
            cancel,
        }
    }

    /// Charge every `(bucket, tokens)` pair. In reject mode either all of
    /// them are charged or none.
    async fn gate(&self, op: Operation, charges: &[(BucketKind, u64)]) -> Result<()> {
        match self.mode {
            ThrottleMode::Wait => {
                for (kind, n) in charges {
                    self.throttler.acquire(*kind, *n, &self.cancel).await?;
                }
                Ok(())
            }
            ThrottleMode::Reject => {
                if self.throttler.try_acquire_many(charges) {
                    Ok(())
                } else {
                    Err(BlobError::Throttled {
                        operation: op.as_str(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Storage for ThrottlingWrapper {
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()> {
        self.gate(
            Operation::Put,
            &[
                (BucketKind::Writes, 1),
                (BucketKind::UploadBytes, data.len() as u64),
            ],
        )
        .await?;
        self.inner.put_blob(id, data, opts).await
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        self.gate(Operation::Get, &[(BucketKind::Reads, 1)]).await?;
        let data = self.inner.get_blob(id).await?;
        self.throttler
            .acquire(BucketKind::DownloadBytes, data.len() as u64, &self.cancel)
            .await?;
        Ok(data)
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.gate(Operation::List, &[(BucketKind::Lists, 1)]).await?;
        self.inner.list_blobs(prefix).await
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        self.gate(Operation::Delete, &[(BucketKind::Writes, 1)]).await?;
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
