//! Per-repository blob operation metrics.
//!
//! [`MetricsRegistry`] keeps in-process counters that can be summarised when
//! a repository closes, and mirrors every observation to the global
//! `metrics` facade so an installed exporter picks them up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{SharedStorage, Storage};
use crate::types::{BlobId, BlobMetadata, ConnectionInfo, Operation, PutOptions};

/// Metric names emitted through the `metrics` facade.
pub mod names {
    /// Blob calls, labeled by method.
    pub const BLOB_CALLS_TOTAL: &str = "strongbox_blob_calls_total";
    /// Failed blob calls, labeled by method.
    pub const BLOB_ERRORS_TOTAL: &str = "strongbox_blob_errors_total";
    /// Payload bytes moved, labeled by method.
    pub const BLOB_BYTES_TOTAL: &str = "strongbox_blob_bytes_total";
    /// Call duration in seconds, labeled by method.
    pub const BLOB_DURATION_SECONDS: &str = "strongbox_blob_duration_seconds";
}

/// Counters for a single storage method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub calls: u64,
    pub errors: u64,
    pub bytes: u64,
    pub total_duration: Duration,
}

/// Registry of blob operation counters shared by every handle onto the same
/// repository connection.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    methods: Mutex<BTreeMap<&'static str, MethodStats>>,
    closed: AtomicBool,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call of `method`.
    pub fn record(&self, method: &'static str, bytes: u64, duration: Duration, failed: bool) {
        {
            let mut methods = self.methods.lock();
            let stats = methods.entry(method).or_default();
            stats.calls += 1;
            stats.bytes += bytes;
            stats.total_duration += duration;
            if failed {
                stats.errors += 1;
            }
        }

        ::metrics::counter!(names::BLOB_CALLS_TOTAL, "method" => method).increment(1);
        if bytes > 0 {
            ::metrics::counter!(names::BLOB_BYTES_TOTAL, "method" => method).increment(bytes);
        }
        if failed {
            ::metrics::counter!(names::BLOB_ERRORS_TOTAL, "method" => method).increment(1);
        }
        ::metrics::histogram!(names::BLOB_DURATION_SECONDS, "method" => method)
            .record(duration.as_secs_f64());
    }

    /// Counters for `method`, zero if it was never called.
    pub fn stats(&self, method: &str) -> MethodStats {
        self.methods.lock().get(method).copied().unwrap_or_default()
    }

    /// Snapshot of every method observed so far.
    pub fn snapshot(&self) -> BTreeMap<&'static str, MethodStats> {
        self.methods.lock().clone()
    }

    pub fn log_summary(&self) {
        for (method, stats) in self.snapshot() {
            tracing::debug!(
                method,
                calls = stats.calls,
                errors = stats.errors,
                bytes = stats.bytes,
                duration = ?stats.total_duration,
                "blob metrics"
            );
        }
    }

    /// Mark the registry closed. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!("metrics registry closed");
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Wrapper recording every call into a [`MetricsRegistry`].
#[derive(Debug)]
pub struct MetricsWrapper {
    inner: SharedStorage,
    registry: Arc<MetricsRegistry>,
}

impl MetricsWrapper {
    pub fn new(inner: SharedStorage, registry: Arc<MetricsRegistry>) -> Self {
        Self { inner, registry }
    }
}

#[async_trait]
impl Storage for MetricsWrapper {
    async fn put_blob(&self, id: &BlobId, data: Bytes, opts: PutOptions) -> Result<()> {
        let start = Instant::now();
        let len = data.len() as u64;
        let result = self.inner.put_blob(id, data, opts).await;
        self.registry
            .record(Operation::Put.as_str(), len, start.elapsed(), result.is_err());
        result
    }

    async fn get_blob(&self, id: &BlobId) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.inner.get_blob(id).await;
        let len = result.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        // a missing blob is an answer, not a failure
        let failed = matches!(&result, Err(e) if !e.is_not_found());
        self.registry
            .record(Operation::Get.as_str(), len, start.elapsed(), failed);
        result
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let start = Instant::now();
        let result = self.inner.list_blobs(prefix).await;
        self.registry
            .record(Operation::List.as_str(), 0, start.elapsed(), result.is_err());
        result
    }

    async fn delete_blob(&self, id: &BlobId) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.delete_blob(id).await;
        self.registry
            .record(Operation::Delete.as_str(), 0, start.elapsed(), result.is_err());
        result
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
