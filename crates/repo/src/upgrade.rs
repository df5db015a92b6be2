//! Enforcement of the repository upgrade lock.
//!
//! Two entry points:
//!
//! - [`wait_for_upgrade_lock`] runs once while opening and blocks (with
//!   backoff) until no foreign lock is in effect.
//! - [`UpgradeLockMonitor`] is installed as a before-operation hook and
//!   re-validates the lock and required features whenever the format
//!   metadata has been re-read since the last successful check.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use blob::{BeforeOperation, BoxError, Operation};

use crate::error::{RepoError, Result};
use crate::feature::{check_required_features, SUPPORTED_FEATURES};
use crate::format::{FormatProvider, FormatRevision, UpgradeLockIntent};
use crate::options::{FatalErrorHandler, TimeNow};
use crate::retry::{with_backoff, Backoff};

/// Error for `intent` if it currently locks out `owner_id`.
fn foreign_lock(intent: Option<&UpgradeLockIntent>, owner_id: &str, time_now: &TimeNow) -> Option<RepoError> {
    let intent = intent?;
    let (locked, _) = intent.is_locked(time_now());
    (locked && intent.owner_id != owner_id).then(|| RepoError::UpgradeInProgress {
        owner: intent.owner_id.clone(),
    })
}

/// Parameters of the open-time wait.
#[derive(Debug, Clone)]
pub struct WaitOptions<'a> {
    pub owner_id: &'a str,
    /// Skip the lock check entirely
    pub permissive: bool,
    pub do_not_wait: bool,
    pub backoff: &'a Backoff,
    pub cancel: &'a CancellationToken,
}

/// Block until the upgrade lock, if any, is held by `opts.owner_id` or not
/// yet in effect. Every retry re-reads the format metadata first.
pub async fn wait_for_upgrade_lock(
    format: &dyn FormatProvider,
    time_now: &TimeNow,
    opts: WaitOptions<'_>,
) -> Result<()> {
    if opts.permissive {
        return Ok(());
    }

    let attempts = AtomicU32::new(0);
    with_backoff(
        "wait for upgrade lock",
        opts.backoff,
        opts.cancel,
        || async {
            if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                format.refresh().await?;
            }
            let intent = format.upgrade_lock_intent().await?;
            match foreign_lock(intent.as_ref(), opts.owner_id, time_now) {
                Some(err) => {
                    tracing::info!(error = %err, "repository upgrade in progress, waiting");
                    Err(err)
                }
                None => Ok(()),
            }
        },
        |e: &RepoError| !opts.do_not_wait && e.is_upgrade_in_progress(),
    )
    .await
}

#[derive(Debug, Default)]
struct Verdict {
    /// Revision at which the last check passed
    verified: Option<FormatRevision>,
    /// Revision at which a foreign lock was found, and its owner
    locked: Option<(FormatRevision, String)>,
}

impl Verdict {
    fn for_revision(&self, revision: FormatRevision) -> Option<Result<()>> {
        if self.verified == Some(revision) {
            return Some(Ok(()));
        }
        match &self.locked {
            Some((r, owner)) if *r == revision => Some(Err(RepoError::UpgradeInProgress {
                owner: owner.clone(),
            })),
            _ => None,
        }
    }
}

/// Before-operation hook enforcing the upgrade lock and required features.
///
/// A check only does I/O when the format revision moved since the last
/// verdict. Concurrent callers on a stale revision share one check.
pub struct UpgradeLockMonitor {
    format: Arc<dyn FormatProvider>,
    owner_id: String,
    time_now: TimeNow,
    on_fatal_error: FatalErrorHandler,
    ignore_missing_features: bool,
    verdict: RwLock<Verdict>,
    check: tokio::sync::Mutex<()>,
    checks: AtomicU64,
}

impl std::fmt::Debug for UpgradeLockMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeLockMonitor")
            .field("owner_id", &self.owner_id)
            .field("verdict", &*self.verdict.read())
            .field("checks", &self.checks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UpgradeLockMonitor {
    pub fn new(
        format: Arc<dyn FormatProvider>,
        owner_id: impl Into<String>,
        time_now: TimeNow,
        on_fatal_error: FatalErrorHandler,
        ignore_missing_features: bool,
    ) -> Self {
        Self {
            format,
            owner_id: owner_id.into(),
            time_now,
            on_fatal_error,
            ignore_missing_features,
            verdict: RwLock::new(Verdict::default()),
            check: tokio::sync::Mutex::new(()),
            checks: AtomicU64::new(0),
        }
    }

    /// Number of full checks run so far.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    /// Validate the current format revision.
    pub async fn check(&self) -> Result<()> {
        let revision = self.format.revision().await?;
        if let Some(v) = self.verdict.read().for_revision(revision) {
            return v;
        }

        let _guard = self.check.lock().await;
        let revision = self.format.revision().await?;
        if let Some(v) = self.verdict.read().for_revision(revision) {
            return v;
        }

        self.checks.fetch_add(1, Ordering::SeqCst);
        let required = self.format.required_features().await?;
        if let Err(err) =
            check_required_features(&required, SUPPORTED_FEATURES, self.ignore_missing_features)
        {
            tracing::error!(error = %err, %revision, "required features changed while connected");
            (self.on_fatal_error)(&err);
            return Err(err);
        }

        let intent = self.format.upgrade_lock_intent().await?;
        if let Some(err) = foreign_lock(intent.as_ref(), &self.owner_id, &self.time_now) {
            if let RepoError::UpgradeInProgress { owner } = &err {
                tracing::warn!(%owner, %revision, "upgrade lock detected, refusing operations");
                self.verdict.write().locked = Some((revision, owner.clone()));
            }
            return Err(err);
        }

        *self.verdict.write() = Verdict {
            verified: Some(revision),
            locked: None,
        };
        Ok(())
    }
}

#[async_trait]
impl BeforeOperation for UpgradeLockMonitor {
    async fn before_operation(&self, _op: Operation) -> std::result::Result<(), BoxError> {
        self.check().await.map_err(|e| Box::new(e) as BoxError)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::feature::RequiredFeature;
    use crate::format::{BlobStorageConfiguration, FormatError};

    /// Format provider whose metadata the test mutates directly.
    #[derive(Debug, Default)]
    struct FakeFormat {
        generation: AtomicU64,
        intent: Mutex<Option<UpgradeLockIntent>>,
        features: Mutex<Vec<RequiredFeature>>,
        intent_reads: AtomicU64,
        refreshes: AtomicU64,
    }

    impl FakeFormat {
        fn bump(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FormatProvider for FakeFormat {
        async fn required_features(&self) -> std::result::Result<Vec<RequiredFeature>, FormatError> {
            Ok(self.features.lock().clone())
        }

        async fn upgrade_lock_intent(
            &self,
        ) -> std::result::Result<Option<UpgradeLockIntent>, FormatError> {
            self.intent_reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(self.intent.lock().clone())
        }

        async fn revision(&self) -> std::result::Result<FormatRevision, FormatError> {
            Ok(FormatRevision::new(
                self.generation.load(Ordering::SeqCst),
                epoch(),
            ))
        }

        async fn refresh(&self) -> std::result::Result<FormatRevision, FormatError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.bump();
            self.revision().await
        }

        async fn blob_cfg(&self) -> std::result::Result<BlobStorageConfiguration, FormatError> {
            Ok(BlobStorageConfiguration::default())
        }

        fn supports_password_change(&self) -> bool {
            true
        }

        fn hmac_secret(&self) -> &[u8] {
            b"hmac"
        }

        fn format_encryption_key(&self) -> &[u8] {
            b"format"
        }

        fn unique_id(&self) -> &[u8] {
            b"unique"
        }
    }

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn fixed_clock() -> TimeNow {
        Arc::new(epoch)
    }

    fn fatal_recorder() -> (FatalErrorHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (Arc::new(move |e: &RepoError| s.lock().push(e.to_string())), seen)
    }

    fn monitor(format: Arc<FakeFormat>, owner: &str) -> (UpgradeLockMonitor, Arc<Mutex<Vec<String>>>) {
        let (fatal, seen) = fatal_recorder();
        (
            UpgradeLockMonitor::new(format, owner, fixed_clock(), fatal, false),
            seen,
        )
    }

    #[tokio::test]
    async fn test_check_runs_once_per_revision() {
        let format = Arc::new(FakeFormat::default());
        let (m, _) = monitor(format.clone(), "");

        m.check().await.unwrap();
        m.check().await.unwrap();
        assert_eq!(m.checks(), 1);

        format.bump();
        m.check().await.unwrap();
        assert_eq!(m.checks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_collapse() {
        let format = Arc::new(FakeFormat::default());
        let (m, _) = monitor(format.clone(), "");
        let m = Arc::new(m);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.check().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(format.intent_reads.load(Ordering::SeqCst), 1);
        assert_eq!(m.checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_lock_verdict_is_cached() {
        let format = Arc::new(FakeFormat::default());
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));
        let (m, _) = monitor(format.clone(), "bob");
        let m = Arc::new(m);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.check().await })
            })
            .collect();
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, RepoError::UpgradeInProgress { ref owner } if owner == "alice"));
        }
        assert_eq!(format.intent_reads.load(Ordering::SeqCst), 1);

        // lock released and metadata re-read
        *format.intent.lock() = None;
        format.bump();
        m.check().await.unwrap();
        assert_eq!(format.intent_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lock_owner_and_pending_lock_pass() {
        let format = Arc::new(FakeFormat::default());
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));
        let (m, _) = monitor(format.clone(), "alice");
        m.check().await.unwrap();

        let mut pending = UpgradeLockIntent::new("alice", epoch());
        pending.advance_notice = Duration::from_secs(3600);
        *format.intent.lock() = Some(pending);
        format.bump();
        let (other, _) = monitor(format.clone(), "bob");
        other.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_required_feature_is_fatal() {
        let format = Arc::new(FakeFormat::default());
        let (m, fatal) = monitor(format.clone(), "");
        m.check().await.unwrap();

        format.features.lock().push(RequiredFeature::new("index-v9"));
        format.bump();
        let err = m.check().await.unwrap_err();
        assert!(err.is_incompatible());
        assert_eq!(fatal.lock().len(), 1);

        // warn-only features are logged but never fatal
        *format.features.lock() = vec![RequiredFeature::warn_only("index-v9")];
        format.bump();
        m.check().await.unwrap();
        assert_eq!(fatal.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_error_carries_repo_error() {
        let format = Arc::new(FakeFormat::default());
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));
        let (m, _) = monitor(format, "");

        let err = m.before_operation(Operation::Get).await.unwrap_err();
        let repo_err = err.downcast_ref::<RepoError>().unwrap();
        assert!(repo_err.is_upgrade_in_progress());
    }

    fn wait_opts<'a>(
        owner_id: &'a str,
        do_not_wait: bool,
        backoff: &'a Backoff,
        cancel: &'a CancellationToken,
    ) -> WaitOptions<'a> {
        WaitOptions {
            owner_id,
            permissive: false,
            do_not_wait,
            backoff,
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_do_not_wait_fails_fast() {
        let format = FakeFormat::default();
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));
        let backoff = Backoff::default();
        let cancel = CancellationToken::new();

        let err = wait_for_upgrade_lock(&format, &fixed_clock(), wait_opts("", true, &backoff, &cancel))
            .await
            .unwrap_err();
        assert!(err.is_upgrade_in_progress());
        assert_eq!(format.refreshes.load(Ordering::SeqCst), 0);

        wait_for_upgrade_lock(&format, &fixed_clock(), wait_opts("alice", true, &backoff, &cancel))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_lock_released() {
        let format = Arc::new(FakeFormat::default());
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));

        let releaser = {
            let format = format.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                *format.intent.lock() = None;
            })
        };

        let backoff = Backoff::default();
        let cancel = CancellationToken::new();
        wait_for_upgrade_lock(format.as_ref(), &fixed_clock(), wait_opts("", false, &backoff, &cancel))
            .await
            .unwrap();
        releaser.await.unwrap();
        assert!(format.refreshes.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let format = FakeFormat::default();
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));
        let backoff = Backoff::default();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cancel.cancel();
            })
        };

        let err = wait_for_upgrade_lock(&format, &fixed_clock(), wait_opts("", false, &backoff, &cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_permissive_skips_lock() {
        let format = FakeFormat::default();
        *format.intent.lock() = Some(UpgradeLockIntent::new("alice", epoch()));
        let backoff = Backoff::default();
        let cancel = CancellationToken::new();
        let opts = WaitOptions {
            permissive: true,
            ..wait_opts("", true, &backoff, &cancel)
        };
        wait_for_upgrade_lock(&format, &fixed_clock(), opts).await.unwrap();
        assert_eq!(format.intent_reads.load(Ordering::SeqCst), 0);
    }
}
