//! Per-open options.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache_keys::ScryptParams;
use crate::debug_dump::DumpConfigs;
use crate::error::RepoError;
use crate::retry::Backoff;

/// Clock used for lock and cache expiry decisions.
pub type TimeNow = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Called when the process can no longer safely use the repository.
pub type FatalErrorHandler = Arc<dyn Fn(&RepoError) + Send + Sync>;

pub fn system_time() -> TimeNow {
    Arc::new(Utc::now)
}

/// Logs the error and terminates the process.
pub fn exit_on_fatal_error() -> FatalErrorHandler {
    Arc::new(|err| {
        tracing::error!(error = %err, "FATAL: repository can no longer be used safely");
        std::process::exit(1);
    })
}

/// Options for a single open call.
#[derive(Clone)]
pub struct Options {
    /// Log every storage call
    pub trace_storage: bool,
    pub time_now: Option<TimeNow>,
    /// Owner id of an upgrade in progress. Only this owner may use the
    /// repository while the upgrade lock is held.
    pub upgrade_owner_id: String,
    /// Fail immediately instead of waiting for an upgrade lock to clear
    pub do_not_wait_for_upgrade: bool,
    /// Backoff between checks while waiting for an upgrade lock
    pub upgrade_backoff: Backoff,
    pub on_fatal_error: Option<FatalErrorHandler>,
    /// Aborts waits during open; the repository's own token is a child of it
    pub cancel: CancellationToken,
    pub cache_key_params: ScryptParams,
    /// Dumps written to stderr when the connection closes. Defaults to
    /// what `STRONGBOX_DEBUG_DUMP` asks for.
    pub debug_dump: Option<DumpConfigs>,
    pub test_only_ignore_missing_required_features: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trace_storage: false,
            time_now: None,
            upgrade_owner_id: String::new(),
            do_not_wait_for_upgrade: false,
            upgrade_backoff: Backoff::default(),
            on_fatal_error: None,
            cancel: CancellationToken::new(),
            cache_key_params: ScryptParams::default(),
            debug_dump: DumpConfigs::from_env(),
            test_only_ignore_missing_required_features: false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("trace_storage", &self.trace_storage)
            .field("upgrade_owner_id", &self.upgrade_owner_id)
            .field("do_not_wait_for_upgrade", &self.do_not_wait_for_upgrade)
            .field("upgrade_backoff", &self.upgrade_backoff)
            .field("cache_key_params", &self.cache_key_params)
            .field("debug_dump", &self.debug_dump)
            .field(
                "test_only_ignore_missing_required_features",
                &self.test_only_ignore_missing_required_features,
            )
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn time_now(&self) -> TimeNow {
        self.time_now.clone().unwrap_or_else(system_time)
    }

    pub fn fatal_error_handler(&self) -> FatalErrorHandler {
        self.on_fatal_error.clone().unwrap_or_else(exit_on_fatal_error)
    }
}
