//! Shared setup for repository open tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blob::testkit::RecordingStorage;
use blob::{ObjectStoreConfig, ObjectStoreStorage, SharedStorage, StorageConfig};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use repo::cache_keys::ScryptParams;
use repo::format::{InitOptions, Manager, ManagerOptions};
use repo::retry::Backoff;
use repo::{ClientOptions, LocalConfig, Options, RepoError, TimeNow};
use tempfile::TempDir;

pub const PASSWORD: &str = "correct horse battery staple";

/// Cheap scrypt parameters so tests do not spend seconds deriving keys.
pub fn cheap_kdf() -> ScryptParams {
    ScryptParams {
        log_n: 4,
        r: 8,
        p: 1,
    }
}

pub fn init_options() -> InitOptions {
    InitOptions {
        kdf: cheap_kdf(),
        ..Default::default()
    }
}

/// Fatal errors seen by a repository under test.
pub type FatalLog = Arc<Mutex<Vec<String>>>;

/// Options that never exit the process and derive keys cheaply.
pub fn test_options() -> (Options, FatalLog) {
    let fatal: FatalLog = Arc::new(Mutex::new(Vec::new()));
    let log = fatal.clone();
    let options = Options {
        cache_key_params: cheap_kdf(),
        on_fatal_error: Some(Arc::new(move |e: &RepoError| log.lock().push(e.to_string()))),
        upgrade_backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100))
            .with_max_retries(3),
        ..Default::default()
    };
    (options, fatal)
}

/// Settable clock.
#[derive(Clone)]
pub struct MockClock(Arc<Mutex<DateTime<Utc>>>);

impl MockClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }

    pub fn advance(&self, d: Duration) {
        let mut t = self.0.lock();
        *t += chrono::Duration::from_std(d).unwrap();
    }

    pub fn time_now(&self) -> TimeNow {
        let inner = self.0.clone();
        Arc::new(move || *inner.lock())
    }
}

/// A repository initialised in a recording in-memory storage.
pub async fn recording_repo(init: InitOptions) -> Arc<RecordingStorage> {
    let base = Arc::new(RecordingStorage::new());
    Manager::initialize(base.as_ref(), PASSWORD, init)
        .await
        .unwrap();
    base
}

/// Open a second, unwrapped manager onto `storage`, e.g. to play the role of
/// an upgrading client.
pub async fn side_manager(storage: SharedStorage, clock: &MockClock) -> Manager {
    Manager::open(
        storage,
        PASSWORD,
        ManagerOptions {
            time_now: clock.time_now(),
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

/// A filesystem repository with a config file pointing at it.
pub struct FsRepo {
    pub dir: TempDir,
    pub config_file: PathBuf,
    pub storage: StorageConfig,
}

impl FsRepo {
    pub async fn create(init: InitOptions, client_options: ClientOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = StorageConfig::from(ObjectStoreConfig::Filesystem {
            path: dir.path().join("blobs"),
        });

        let base = ObjectStoreStorage::new(storage.clone()).await.unwrap();
        Manager::initialize(&base, PASSWORD, init).await.unwrap();

        let config_file = dir.path().join("repository.config");
        LocalConfig {
            storage: Some(storage.clone()),
            caching: None,
            client_options,
        }
        .write_to_file(&config_file)
        .unwrap();

        Self {
            dir,
            config_file,
            storage,
        }
    }

    pub fn config(&self) -> LocalConfig {
        LocalConfig::load_from_file(&self.config_file).unwrap()
    }

    /// Unwrapped storage onto the same directory.
    pub async fn raw_storage(&self) -> SharedStorage {
        Arc::new(ObjectStoreStorage::new(self.storage.clone()).await.unwrap())
    }
}
