//! Error types for opening and operating a repository.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use blob::throttling::ThrottlerError;
use blob::BlobError;

use crate::cache_keys::DerivationError;
use crate::cache_protection::ProtectionError;
use crate::format::FormatError;

/// Errors returned while opening or operating a repository.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// A required feature is not supported by this build
    #[error("{message}")]
    Incompatible {
        feature: String,
        message: String,
    },

    /// Another owner holds the exclusive upgrade lock
    #[error("repository upgrade in progress (lock held by {owner:?})")]
    UpgradeInProgress { owner: String },

    #[error("storage not set in the configuration file")]
    StorageNotConfigured,

    #[error("cannot write to a repository connection with permissive cache loading, reconnect read-only")]
    PermissiveCacheLoadingRequiresReadOnly,

    #[error("cannot open storage: {0}")]
    OpenStorage(#[source] BlobError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("repository format: {0}")]
    Format(#[from] FormatError),

    #[error("unable to derive cache keys: {0}")]
    Derivation(#[from] DerivationError),

    #[error("unable to set up cache protection: {0}")]
    Protection(#[from] ProtectionError),

    #[error("unable to add throttler: {0}")]
    Throttler(#[from] ThrottlerError),

    #[error(transparent)]
    Storage(#[from] BlobError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("repository is closed")]
    Closed,

    #[error(transparent)]
    Close(#[from] CloseErrors),
}

impl RepoError {
    /// The repository error a storage hook raised inside `err`, if any.
    pub fn from_rejection(err: &BlobError) -> Option<&RepoError> {
        err.rejection().and_then(|e| e.downcast_ref::<RepoError>())
    }

    /// True if this error, or a hook error it carries, reports a foreign
    /// upgrade lock.
    pub fn is_upgrade_in_progress(&self) -> bool {
        match self {
            RepoError::UpgradeInProgress { .. } => true,
            RepoError::Storage(e) => {
                Self::from_rejection(e).is_some_and(RepoError::is_upgrade_in_progress)
            }
            _ => false,
        }
    }

    /// True if this error, or a hook error it carries, reports a missing
    /// required feature.
    pub fn is_incompatible(&self) -> bool {
        match self {
            RepoError::Incompatible { .. } => true,
            RepoError::Storage(e) => Self::from_rejection(e).is_some_and(RepoError::is_incompatible),
            _ => false,
        }
    }

    pub fn is_invalid_password(&self) -> bool {
        matches!(self, RepoError::Format(FormatError::InvalidPassword))
    }
}

impl From<crate::retry::Cancelled> for RepoError {
    fn from(_: crate::retry::Cancelled) -> Self {
        RepoError::Cancelled
    }
}

/// Result type alias for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors reading or writing the local connection config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error resolving config file path {path}: {source}")]
    ResolvePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Every error raised while running release functions, in the order the
/// functions ran.
#[derive(Debug, Clone, Default)]
pub struct CloseErrors(Vec<Arc<dyn std::error::Error + Send + Sync + 'static>>);

impl CloseErrors {
    pub fn push(&mut self, err: blob::BoxError) {
        self.0.push(Arc::from(err));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync + 'static)> {
        self.0.iter().map(|e| e.as_ref())
    }

    /// `Ok` when nothing failed.
    pub fn into_result(self) -> std::result::Result<(), CloseErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) while closing", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            write!(f, "{} {}", if i == 0 { ":" } else { ";" }, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_lock_error_is_recognised_through_storage() {
        let hook_err: blob::BoxError = Box::new(RepoError::UpgradeInProgress {
            owner: "alice".into(),
        });
        let err = RepoError::Storage(BlobError::rejected("PutBlob", hook_err));
        assert!(err.is_upgrade_in_progress());
        assert!(!err.is_incompatible());
        assert!(!RepoError::Storage(BlobError::Cancelled).is_upgrade_in_progress());
    }

    #[test]
    fn test_close_errors_display_lists_every_failure() {
        let mut errs = CloseErrors::default();
        assert!(errs.clone().into_result().is_ok());
        errs.push("first".into());
        errs.push("second".into());
        assert_eq!(errs.len(), 2);
        assert_eq!(errs.to_string(), "2 error(s) while closing: first; second");
    }
}
