//! In-memory storage for tests that need to see what reached the base store.
//!
//! ```rust,ignore
//! use blob::testkit::RecordingStorage;
//!
//! let base = Arc::new(RecordingStorage::new());
//! let chain = StorageChain::new().with(Layer::ReadOnly).build(base.clone());
//! assert!(chain.put_blob(&id, data, PutOptions::default()).await.is_err());
//! assert!(base.puts().is_empty());
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{BlobError, Result};
use crate::storage::Storage;
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, Operation, PutOptions};

/// A call observed by [`RecordingStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: Operation,
    /// Blob id, or the prefix for list calls
    pub target: String,
}

/// Map-backed storage that records every call and the put options it saw.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    blobs: Mutex<BTreeMap<BlobId, (Bytes, BlobMetadata)>>,
    calls: Mutex<Vec<RecordedCall>>,
    puts: Mutex<Vec<(BlobId, PutOptions)>>,
    connection_info: Mutex<ConnectionInfo>,
    closes: AtomicUsize,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self {
            connection_info: Mutex::new(ConnectionInfo {
                kind: "recording".to_string(),
                config: serde_json::json!({}),
            }),
            ..Default::default()
        }
    }

    /// Advertise `config` as this storage's connection config.
    pub fn with_connection_config(self, config: serde_json::Value) -> Self {
        self.connection_info.lock().config = config;
        self
    }

    /// Every call in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of `op` seen so far.
    pub fn count(&self, op: Operation) -> usize {
        self.calls.lock().iter().filter(|c| c.operation == op).count()
    }

    /// Put calls with the options that reached this storage.
    pub fn puts(&self) -> Vec<(BlobId, PutOptions)> {
        self.puts.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Contents of `id`, bypassing the call log.
    pub fn peek(&self, id: &BlobId) -> Option<Bytes> {
        self.blobs.lock().get(id).map(|(data, _)| data.clone())
    }

    fn record(&self, operation: Operation, target: &str) {
        self.calls.lock().push(RecordedCall {
            operation,
            target: target.to_string(),
        });
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()> {
        self.record(Operation::Put, id.as_str());
        self.puts.lock().push((id.clone(), opts));
        let meta = BlobMetadata {
            id: id.clone(),
            length: data.len() as u64,
            timestamp: Utc::now(),
        };
        self.blobs.lock().insert(id.clone(), (data, meta));
        Ok(())
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        self.record(Operation::Get, id.as_str());
        self.blobs
            .lock()
            .get(id)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BlobError::NotFound(id.clone()))
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        self.record(Operation::List, prefix);
        Ok(self
            .blobs
            .lock()
            .values()
            .filter(|(_, meta)| meta.id.has_prefix(prefix))
            .map(|(_, meta)| meta.clone())
            .collect())
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        self.record(Operation::Delete, id.as_str());
        self.blobs.lock().remove(id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.connection_info.lock().clone()
    }

    fn display_name(&self) -> String {
        "Recording Storage".to_string()
    }
}
