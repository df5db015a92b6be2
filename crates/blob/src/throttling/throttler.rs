use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bucket::TokenBucket;
use super::Limits;
use crate::error::{BlobError, BoxError};

/// Callback invoked with the new limits after every successful update.
pub type UpdateCallback = Box<dyn Fn(&Limits) -> Result<(), BoxError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ThrottlerError {
    #[error("invalid throttling limits: {0}")]
    InvalidLimits(String),
    /// The new limits are in effect but could not be persisted
    #[error("throttling limits applied but not persisted: {0}")]
    Persist(#[source] BoxError),
}

/// Operation classes with their own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    Reads,
    Writes,
    Lists,
    UploadBytes,
    DownloadBytes,
}

impl BucketKind {
    pub const ALL: [BucketKind; 5] = [
        BucketKind::Reads,
        BucketKind::Writes,
        BucketKind::Lists,
        BucketKind::UploadBytes,
        BucketKind::DownloadBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Reads => "readsPerSecond",
            BucketKind::Writes => "writesPerSecond",
            BucketKind::Lists => "listsPerSecond",
            BucketKind::UploadBytes => "maxUploadSpeedBytesPerSecond",
            BucketKind::DownloadBytes => "maxDownloadSpeedBytesPerSecond",
        }
    }

    fn index(&self) -> usize {
        match self {
            BucketKind::Reads => 0,
            BucketKind::Writes => 1,
            BucketKind::Lists => 2,
            BucketKind::UploadBytes => 3,
            BucketKind::DownloadBytes => 4,
        }
    }
}

/// Rate limiter shared by every operation issued through a repository.
pub struct Throttler {
    window: Duration,
    initial_fill: f64,
    limits: RwLock<Limits>,
    buckets: [Mutex<TokenBucket>; 5],
    on_update: RwLock<Option<UpdateCallback>>,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("window", &self.window)
            .field("initial_fill", &self.initial_fill)
            .field("limits", &*self.limits.read())
            .finish()
    }
}

impl Throttler {
    /// Create a throttler whose buckets hold `rate * window` tokens and
    /// start `initial_fill` (0..=1) full.
    pub fn new(limits: Limits, window: Duration, initial_fill: f64) -> Result<Self, ThrottlerError> {
        limits.validate()?;
        if !(0.0..=1.0).contains(&initial_fill) {
            return Err(ThrottlerError::InvalidLimits(format!(
                "initial fill must be within 0..=1, got {}",
                initial_fill
            )));
        }
        if window.is_zero() {
            return Err(ThrottlerError::InvalidLimits(
                "replenishment window must be positive".to_string(),
            ));
        }

        let now = Instant::now();
        let buckets = BucketKind::ALL
            .map(|kind| Mutex::new(TokenBucket::new(limits.rate(kind), window, initial_fill, now)));

        Ok(Self {
            window,
            initial_fill,
            limits: RwLock::new(limits),
            buckets,
            on_update: RwLock::new(None),
        })
    }

    pub fn limits(&self) -> Limits {
        *self.limits.read()
    }

    /// Register the callback used to persist limits after an update.
    pub fn on_update(&self, callback: UpdateCallback) {
        *self.on_update.write() = Some(callback);
    }

    /// Swap the active limits.
    ///
    /// Tokens already accrued are kept (clamped to the new capacity). If the
    /// persistence callback fails the new limits stay in effect and the
    /// error is returned.
    pub fn set_limits(&self, limits: Limits) -> Result<(), ThrottlerError> {
        limits.validate()?;

        {
            let mut current = self.limits.write();
            let now = Instant::now();
            for kind in BucketKind::ALL {
                self.buckets[kind.index()].lock().set_rate(
                    limits.rate(kind),
                    self.window,
                    self.initial_fill,
                    now,
                );
            }
            *current = limits;
        }

        tracing::info!(?limits, "throttling limits updated");

        if let Some(callback) = self.on_update.read().as_ref() {
            callback(&limits).map_err(ThrottlerError::Persist)?;
        }

        Ok(())
    }

    /// Wait until `n` tokens are available in `kind`'s bucket and take them.
    ///
    /// Returns [`BlobError::Cancelled`] as soon as `cancel` fires.
    pub async fn acquire(
        &self,
        kind: BucketKind,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<(), BlobError> {
        loop {
            if cancel.is_cancelled() {
                return Err(BlobError::Cancelled);
            }

            let wait = match self.buckets[kind.index()]
                .lock()
                .try_take(n as f64, Instant::now())
            {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            tracing::trace!(bucket = kind.as_str(), ?wait, "throttled");

            tokio::select! {
                _ = cancel.cancelled() => return Err(BlobError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, kind: BucketKind, n: u64) -> bool {
        self.try_acquire_many(&[(kind, n)])
    }

    /// Take tokens from several buckets at once, or from none of them.
    ///
    /// Each kind may appear at most once in `requests`.
    pub fn try_acquire_many(&self, requests: &[(BucketKind, u64)]) -> bool {
        let mut ordered = requests.to_vec();
        ordered.sort_by_key(|(kind, _)| kind.index());

        // lock in index order so concurrent callers cannot deadlock
        let now = Instant::now();
        let mut guards: Vec<_> = ordered
            .iter()
            .map(|(kind, n)| (self.buckets[kind.index()].lock(), *n as f64))
            .collect();

        if !guards.iter_mut().all(|(bucket, n)| bucket.can_take(*n, now)) {
            return false;
        }
        guards
            .iter_mut()
            .all(|(bucket, n)| bucket.try_take(*n, now).is_ok())
    }

    /// Tokens currently available in `kind`'s bucket.
    pub fn available(&self, kind: BucketKind) -> f64 {
        self.buckets[kind.index()].lock().available(Instant::now())
    }

    /// Capacity of `kind`'s bucket; zero when unlimited.
    pub fn capacity(&self, kind: BucketKind) -> f64 {
        self.buckets[kind.index()].lock().capacity()
    }
}
