//! Blob storage for strongbox repositories
//!
//! This crate provides the [`Storage`] capability every repository layer talks
//! to, a base implementation over the `object_store` crate
//! (S3/MinIO/local filesystem/memory) and the wrapper layers that are stacked
//! on top of it:
//!
//! - **metrics** - per-method counters ([`metrics::MetricsRegistry`])
//! - **tracing** - logs every call
//! - **read-only** - refuses puts and deletes
//! - **throttling** - token buckets per operation class
//! - **retention** - tags protected blobs with WORM retention options
//! - **before-op** - runs a veto hook before every call
//!
//! Layers are composed with [`StorageChain`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blob::{Layer, ObjectStoreStorage, StorageChain};
//!
//! let base = Arc::new(ObjectStoreStorage::memory());
//! let storage = StorageChain::new().with(Layer::ReadOnly).build(base);
//! ```

mod backend;
mod beforeop;
mod chain;
mod error;
mod logging;
pub mod metrics;
mod readonly;
mod retention;
mod storage;
pub mod throttling;
mod types;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use backend::{
    ObjectStoreConfig, ObjectStoreStorage, StorageConfig, RETENTION_MODE_TAG,
    RETENTION_PERIOD_TAG,
};
pub use beforeop::{BeforeOpWrapper, BeforeOperation};
pub use chain::{Layer, StorageChain};
pub use error::{BlobError, BoxError, Result};
pub use logging::{TracingWrapper, DEFAULT_PREFIX as DEFAULT_TRACE_PREFIX};
pub use readonly::ReadOnlyWrapper;
pub use retention::RetentionWrapper;
pub use storage::{SharedStorage, Storage};
pub use types::{BlobId, BlobMetadata, ConnectionInfo, Operation, PutOptions, RetentionMode};
