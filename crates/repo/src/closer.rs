//! Reference-counted release of resources shared by repository handles.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use blob::BoxError;

use crate::error::{CloseErrors, RepoError, Result};

/// A release function registered with a [`RefCountedCloser`].
pub type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send>;

#[derive(Default)]
struct CloserState {
    refs: usize,
    closed: bool,
    early: Vec<CloseFn>,
    release: Vec<CloseFn>,
}

/// Runs release functions once the last reference is closed.
///
/// Starts with one reference. Early-close functions run first, in
/// registration order; release functions run after them in reverse
/// registration order. Every function runs even if an earlier one failed
/// and all failures are reported together. Once closed, every further
/// `close` returns the same result.
pub struct RefCountedCloser {
    state: Mutex<CloserState>,
    result: OnceCell<std::result::Result<(), CloseErrors>>,
}

impl std::fmt::Debug for RefCountedCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RefCountedCloser")
            .field("refs", &state.refs)
            .field("closed", &state.closed)
            .field("early", &state.early.len())
            .field("release", &state.release.len())
            .finish()
    }
}

impl Default for RefCountedCloser {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCountedCloser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloserState {
                refs: 1,
                ..Default::default()
            }),
            result: OnceCell::new(),
        }
    }

    /// Register a function run after the last reference is released.
    pub fn register<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RepoError::Closed);
        }
        state.release.push(Box::new(move || f().boxed()));
        Ok(())
    }

    /// Register a function run before any release function.
    pub fn register_early_close<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RepoError::Closed);
        }
        state.early.push(Box::new(move || f().boxed()));
        Ok(())
    }

    /// Take another reference. Fails once the closer has shut down.
    pub fn add_ref(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RepoError::Closed);
        }
        state.refs += 1;
        Ok(())
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().refs
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Release one reference, running the registered functions if it was
    /// the last one.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.refs = state.refs.saturating_sub(1);
                if state.refs > 0 {
                    tracing::debug!(remaining = state.refs, "reference released");
                    return Ok(());
                }
                state.closed = true;
            }
        }

        self.result
            .get_or_init(|| self.run_release())
            .await
            .clone()
            .map_err(RepoError::Close)
    }

    async fn run_release(&self) -> std::result::Result<(), CloseErrors> {
        let (early, release) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.early),
                std::mem::take(&mut state.release),
            )
        };

        let mut errors = CloseErrors::default();
        for f in early.into_iter().chain(release.into_iter().rev()) {
            if let Err(e) = f().await {
                tracing::warn!(error = %e, "release function failed");
                errors.push(e);
            }
        }
        errors.into_result()
    }
}
