use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::duration_secs;
use super::FormatError;

/// Declaration, stored in the repository blob, that an upgrade claims
/// exclusive access to the repository.
///
/// The lock takes effect `advance_notice` after `creation_time`, giving
/// other clients a chance to notice it before it blocks them. Writers are
/// considered drained once `io_drain_timeout` plus twice the permitted clock
/// drift has passed after that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeLockIntent {
    pub owner_id: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default, with = "duration_secs")]
    pub advance_notice: Duration,
    #[serde(with = "duration_secs")]
    pub io_drain_timeout: Duration,
    #[serde(default, with = "duration_secs")]
    pub status_poll_interval: Duration,
    #[serde(default, with = "duration_secs")]
    pub max_permitted_clock_drift: Duration,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl UpgradeLockIntent {
    /// A lock owned by `owner_id` that takes effect immediately.
    pub fn new(owner_id: impl Into<String>, creation_time: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            creation_time,
            advance_notice: Duration::ZERO,
            io_drain_timeout: Duration::from_secs(15 * 60),
            status_poll_interval: Duration::from_secs(60),
            max_permitted_clock_drift: Duration::from_secs(5),
            message: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.owner_id.is_empty() {
            return Err(FormatError::InvalidLockIntent("no owner id set".into()));
        }
        if self.io_drain_timeout.is_zero() {
            return Err(FormatError::InvalidLockIntent(
                "io drain timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// When the lock starts blocking other clients.
    pub fn lock_time(&self) -> DateTime<Utc> {
        add(self.creation_time, self.advance_notice)
    }

    /// When in-flight writes of other clients are assumed finished.
    pub fn drain_time(&self) -> DateTime<Utc> {
        let drain = self
            .io_drain_timeout
            .saturating_add(self.max_permitted_clock_drift.saturating_mul(2));
        add(self.lock_time(), drain)
    }

    /// `(locked, writers_drained)` as of `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> (bool, bool) {
        if now < self.lock_time() {
            return (false, false);
        }
        (true, now >= self.drain_time())
    }
}

/// `t + d`, saturating at the end of time.
fn add(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
