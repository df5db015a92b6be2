use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use blob::metrics::MetricsRegistry;
use blob::throttling::{Limits, Throttler};
use blob::SharedStorage;

use crate::closer::RefCountedCloser;
use crate::config::ClientOptions;
use crate::content::SharedManager;
use crate::error::{CloseErrors, RepoError, Result};
use crate::format::FormatProvider;
use crate::options::TimeNow;
use crate::upgrade::UpgradeLockMonitor;

/// Everything a [`DirectRepository`] handle is built from.
pub(crate) struct Parts {
    pub shared: Arc<SharedManager>,
    pub throttler: Arc<Throttler>,
    pub monitor: Option<Arc<UpgradeLockMonitor>>,
    pub closer: Arc<RefCountedCloser>,
    pub client_options: ClientOptions,
    pub config_file: Option<PathBuf>,
    pub time_now: TimeNow,
    pub cancel: CancellationToken,
}

/// Handle to an open repository.
///
/// Handles created with [`DirectRepository::new_session`] share storage,
/// throttler and metrics with the handle they came from. Shared resources
/// are released when the last handle is closed.
pub struct DirectRepository {
    parts: Arc<Parts>,
    session_id: String,
    purpose: String,
    closed: OnceCell<std::result::Result<(), CloseErrors>>,
}

impl std::fmt::Debug for DirectRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectRepository")
            .field("session_id", &self.session_id)
            .field("purpose", &self.purpose)
            .field("description", &self.parts.client_options.description)
            .field("read_only", &self.parts.client_options.read_only)
            .field("closed", &self.closed.initialized())
            .finish()
    }
}

impl DirectRepository {
    pub(crate) fn new(parts: Parts) -> Self {
        Self {
            parts: Arc::new(parts),
            session_id: Uuid::new_v4().to_string(),
            purpose: String::new(),
            closed: OnceCell::new(),
        }
    }

    /// Fully wrapped blob storage.
    pub fn blobs(&self) -> &SharedStorage {
        self.parts.shared.storage()
    }

    pub fn format(&self) -> &Arc<dyn FormatProvider> {
        self.parts.shared.format()
    }

    pub fn shared(&self) -> &Arc<SharedManager> {
        &self.parts.shared
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.parts.throttler
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.parts.shared.metrics()
    }

    /// Lock monitor installed on the storage, absent with permissive cache
    /// loading.
    pub fn upgrade_lock_monitor(&self) -> Option<&Arc<UpgradeLockMonitor>> {
        self.parts.monitor.as_ref()
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.parts.client_options
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.parts.config_file.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.parts.client_options.description
    }

    pub fn is_read_only(&self) -> bool {
        self.parts.client_options.read_only
    }

    /// Hex encoded repository unique id.
    pub fn unique_id(&self) -> String {
        hex::encode(self.format().unique_id())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn time(&self) -> chrono::DateTime<chrono::Utc> {
        (self.parts.time_now)()
    }

    /// Fires when the repository is closed or the token passed at open time
    /// is cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.parts.cancel
    }

    /// Replace the throttling limits. They are written to the config file
    /// when the repository was opened from one.
    pub fn set_throttling_limits(&self, limits: Limits) -> Result<()> {
        self.parts.throttler.set_limits(limits)?;
        Ok(())
    }

    /// Start a writer session over the same shared resources.
    pub fn new_session(&self, purpose: &str) -> Result<DirectRepository> {
        if self.closed.initialized() {
            return Err(RepoError::Closed);
        }
        self.parts.closer.add_ref()?;

        let session = Self {
            parts: self.parts.clone(),
            session_id: Uuid::new_v4().to_string(),
            purpose: purpose.to_string(),
            closed: OnceCell::new(),
        };
        tracing::debug!(session_id = %session.session_id, purpose, "writer session started");
        Ok(session)
    }

    /// Release this handle. Closing twice returns the first result.
    pub async fn close(&self) -> Result<()> {
        let result = self
            .closed
            .get_or_init(|| async {
                tracing::debug!(session_id = %self.session_id, "closing repository handle");
                match self.parts.closer.close().await {
                    Ok(()) => Ok(()),
                    Err(RepoError::Close(errors)) => Err(errors),
                    Err(other) => {
                        let mut errors = CloseErrors::default();
                        errors.push(Box::new(other));
                        Err(errors)
                    }
                }
            })
            .await;
        result.clone().map_err(RepoError::Close)
    }
}
