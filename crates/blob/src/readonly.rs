//! Wrapper that refuses every mutating call.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BlobError, Result};
use crate::storage::{SharedStorage, Storage};
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, Operation, PutOptions};

#[derive(Debug)]
pub struct ReadOnlyWrapper {
    inner: SharedStorage,
}

impl ReadOnlyWrapper {
    pub fn new(inner: SharedStorage) -> Self {
        Self { inner }
    }
}

fn denied(op: Operation) -> BlobError {
    BlobError::ReadOnly {
        operation: op.as_str(),
    }
}

#[async_trait]
impl Storage for ReadOnlyWrapper {
    async fn put_blob(&self, _id: &BlobId, _data: Bytes, _opts: PutOptions) -> Result<()> {
        Err(denied(Operation::Put))
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        self.inner.get_blob(id).await
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.inner.list_blobs(prefix).await
    }

    async fn delete_blob(&self, _id: &BlobId) -> Result<()> {
        Err(denied(Operation::Delete))
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::ObjectStoreStorage;

    #[tokio::test]
    async fn test_mutations_are_denied_reads_pass() {
        let base = Arc::new(ObjectStoreStorage::memory());
        let id = BlobId::from("q1");
        base.put_blob(&id, Bytes::from_static(b"abc"), PutOptions::default())
            .await
            .unwrap();

        let ro = ReadOnlyWrapper::new(base.clone());
        assert_eq!(ro.get_blob(&id).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(ro.list_blobs("q").await.unwrap().len(), 1);

        let err = ro
            .put_blob(&id, Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::ReadOnly { operation: "PutBlob" }));

        let err = ro.delete_blob(&id).await.unwrap_err();
        assert!(matches!(err, BlobError::ReadOnly { operation: "DeleteBlob" }));

        // the blob survived
        assert!(base.get_blob(&id).await.is_ok());
    }
}
