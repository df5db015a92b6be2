//! Wrapper that runs a hook before every blob operation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BlobError, BoxError, Result};
use crate::storage::{SharedStorage, Storage};
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, Operation, PutOptions};

/// A check that may veto a storage operation before it reaches the inner
/// storage.
#[async_trait]
pub trait BeforeOperation: Send + Sync + std::fmt::Debug {
    async fn before_operation(&self, op: Operation) -> std::result::Result<(), BoxError>;
}

/// Storage wrapper that consults a [`BeforeOperation`] hook on every call.
/// A hook error fails the call with [`BlobError::Rejected`].
#[derive(Debug)]
pub struct BeforeOpWrapper {
    inner: SharedStorage,
    hook: Arc<dyn BeforeOperation>,
}

impl BeforeOpWrapper {
    pub fn new(inner: SharedStorage, hook: Arc<dyn BeforeOperation>) -> Self {
        Self { inner, hook }
    }

    async fn check(&self, op: Operation) -> Result<()> {
        self.hook
            .before_operation(op)
            .await
            .map_err(|e| BlobError::rejected(op.as_str(), e))
    }
}

#[async_trait]
impl Storage for BeforeOpWrapper {
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()> {
        self.check(Operation::Put).await?;
        self.inner.put_blob(id, data, opts).await
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        self.check(Operation::Get).await?;
        self.inner.get_blob(id).await
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.check(Operation::List).await?;
        self.inner.list_blobs(prefix).await
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        self.check(Operation::Delete).await?;
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

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::testkit::RecordingStorage;

    #[derive(Debug, thiserror::Error)]
    #[error("locked by {0}")]
    struct Locked(String);

    #[derive(Debug, Default)]
    struct DenyWrites {
        seen: Mutex<Vec<Operation>>,
    }

    #[async_trait]
    impl BeforeOperation for DenyWrites {
        async fn before_operation(&self, op: Operation) -> std::result::Result<(), BoxError> {
            self.seen.lock().push(op);
            if op.is_mutating() {
                return Err(Box::new(Locked("alice".into())));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hook_runs_first_and_keeps_error_identity() {
        let base = Arc::new(RecordingStorage::new());
        let hook = Arc::new(DenyWrites::default());
        let st = BeforeOpWrapper::new(base.clone(), hook.clone());

        st.list_blobs("").await.unwrap();
        let err = st
            .put_blob(&BlobId::from("p1"), Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap_err();

        let locked = err
            .rejection()
            .and_then(|e| e.downcast_ref::<Locked>())
            .unwrap();
        assert_eq!(locked.0, "alice");

        // the vetoed put never reached the base storage
        assert!(base.puts().is_empty());
        assert_eq!(*hook.seen.lock(), vec![Operation::List, Operation::Put]);
    }
}
