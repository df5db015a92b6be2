//! Connecting to strongbox repositories
//!
//! This crate turns a connection config (or an already connected blob
//! storage) plus a password into a [`DirectRepository`]:
//!
//! - checks the features the repository requires against [`SUPPORTED_FEATURES`]
//! - derives the secrets protecting the local cache
//! - wraps the storage with throttling, retention and upgrade lock
//!   enforcement
//! - waits for, and keeps watching, the repository upgrade lock
//! - releases shared resources once the last handle is closed
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn run() -> repo::Result<()> {
//! use std::path::Path;
//!
//! let repo = repo::open(Path::new("repository.config"), "secret", repo::Options::default()).await?;
//! println!("connected to {}", repo.description());
//! repo.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache_keys;
pub mod cache_protection;
mod closer;
pub mod config;
mod content;
pub mod debug_dump;
mod error;
pub mod feature;
pub mod format;
mod open;
mod options;
mod repository;
pub mod retry;
pub mod upgrade;

pub use cache_keys::{CacheSecrets, DerivationError, ScryptParams};
pub use closer::{CloseFn, RefCountedCloser};
pub use config::{CachingOptions, ClientOptions, LocalConfig};
pub use content::SharedManager;
pub use error::{CloseErrors, ConfigError, RepoError, Result};
pub use feature::{check_required_features, RequiredFeature, SUPPORTED_FEATURES};
pub use format::{FormatError, FormatProvider, Manager};
pub use open::{
    open, open_direct, open_with_config, open_with_format, throttling_limits_from_connection_info,
    transport_chain, FormatConnection, THROTTLE_BUCKET_INITIAL_FILL, THROTTLING_WINDOW,
};
pub use options::{exit_on_fatal_error, system_time, FatalErrorHandler, Options, TimeNow};
pub use repository::DirectRepository;
pub use upgrade::UpgradeLockMonitor;
