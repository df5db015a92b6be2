//! Retry with exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Returned by [`with_backoff`] when the cancellation token fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Retries after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 1.5,
            max_retries: None,
        }
    }

    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }
}

impl Default for Backoff {
    /// 100ms growing by 1.5x up to 32s, unlimited retries.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(32))
    }
}

/// Run `attempt` until it succeeds, fails with an error `is_retryable`
/// rejects, or the retry budget runs out. The cancellation token is checked
/// before every attempt and interrupts the wait between attempts.
pub async fn with_backoff<T, E, F, Fut, P>(
    desc: &str,
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut attempt: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: From<Cancelled> + fmt::Display,
{
    let mut retries = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let err = match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !is_retryable(&err) {
            return Err(err);
        }
        if backoff.max_retries.is_some_and(|max| retries >= max) {
            tracing::debug!(desc, retries, error = %err, "giving up");
            return Err(err);
        }

        let delay = backoff.delay(retries);
        retries += 1;
        tracing::debug!(desc, attempt = retries, ?delay, error = %err, "retrying");

        tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
