//! Error types for blob storage and its wrapper layers.

use std::sync::Arc;

use crate::types::BlobId;

/// Boxed error raised by a collaborator hooked into the storage chain.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when working with blob storage.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BlobError {
    /// Blob not found
    #[error("blob not found: {0}")]
    NotFound(BlobId),

    /// A mutating call reached a read-only storage
    #[error("storage is read-only, {operation} is not permitted")]
    ReadOnly {
        /// Operation that was refused
        operation: &'static str,
    },

    /// Rate limit exhausted and the throttler is configured to reject
    #[error("{operation} throttled: rate limit exhausted")]
    Throttled {
        /// Operation that was refused
        operation: &'static str,
    },

    /// The caller's cancellation signal fired while waiting
    #[error("operation cancelled")]
    Cancelled,

    /// A before-operation hook refused the call. The original error is kept
    /// so callers can inspect it with `downcast_ref`.
    #[error("{operation} rejected: {source}")]
    Rejected {
        /// Operation that was refused
        operation: &'static str,
        /// Error raised by the hook
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Error returned by the backing object store
    #[error("{operation} {id} failed: {source}")]
    Backend {
        /// Operation that failed
        operation: &'static str,
        /// Blob id, or the list prefix for list calls
        id: String,
        /// Error returned by the backend
        #[source]
        source: Arc<object_store::Error>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// S3 bucket not found - must be created before use
    #[error("S3 bucket '{0}' does not exist, create it before connecting")]
    BucketNotFound(String),
}

impl BlobError {
    /// Wrap a hook error, keeping it reachable through [`BlobError::rejection`].
    pub fn rejected(operation: &'static str, source: BoxError) -> Self {
        BlobError::Rejected {
            operation,
            source: Arc::from(source),
        }
    }

    /// The error a before-operation hook raised, if this is a rejection.
    pub fn rejection(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            BlobError::Rejected { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }

    pub(crate) fn backend(operation: &'static str, id: impl Into<String>, e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { .. } => BlobError::NotFound(BlobId::from(id.into())),
            other => BlobError::Backend {
                operation,
                id: id.into(),
                source: Arc::new(other),
            },
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(Arc::new(e))
    }
}

/// Result type alias for blob storage operations.
pub type Result<T> = std::result::Result<T, BlobError>;
