//! Opening a repository.
//!
//! ```text
//! open(config file)
//!   └─ open_direct: connect the base storage from the config
//!        └─ open_with_config: transport chain + format manager
//!             └─ open_with_format: feature gate, cache keys, throttler,
//!                retention, upgrade lock wait, monitor, shared manager
//! ```
//!
//! The storage chain is built in two stages. The transport stage (metrics,
//! tracing, read-only) is what the format manager reads through; the policy
//! stage (throttling, retention, upgrade lock monitor) is stacked on top of
//! it for everything else.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use blob::metrics::MetricsRegistry;
use blob::throttling::{Limits, Throttler, UpdateCallback};
use blob::{
    BoxError, ConnectionInfo, Layer, ObjectStoreStorage, SharedStorage, StorageChain,
    DEFAULT_TRACE_PREFIX,
};

use crate::cache_keys::CacheSecrets;
use crate::closer::RefCountedCloser;
use crate::config::{absolute_config_path, CachingOptions, ClientOptions, LocalConfig};
use crate::content::SharedManager;
use crate::debug_dump::write_dumps;
use crate::error::{RepoError, Result};
use crate::feature::{check_required_features, SUPPORTED_FEATURES};
use crate::format::{retention_protected_prefixes, FormatProvider, Manager, ManagerOptions};
use crate::options::Options;
use crate::repository::{DirectRepository, Parts};
use crate::upgrade::{wait_for_upgrade_lock, UpgradeLockMonitor, WaitOptions};

/// Window over which throttling tokens accumulate.
pub const THROTTLING_WINDOW: Duration = Duration::from_secs(60);

/// Fraction of each bucket available right after opening.
pub const THROTTLE_BUCKET_INITIAL_FILL: f64 = 0.1;

/// Open the repository described by the config file at `config_file`.
pub async fn open(config_file: &Path, password: &str, options: Options) -> Result<DirectRepository> {
    let result = open_config_file(config_file, password, options).await;
    if let Err(e) = &result {
        tracing::error!(config_file = %config_file.display(), error = %e, "failed to open repository");
    }
    result
}

async fn open_config_file(
    config_file: &Path,
    password: &str,
    options: Options,
) -> Result<DirectRepository> {
    let config_file = absolute_config_path(config_file)?;
    let lc = LocalConfig::load_from_file(&config_file)?;

    if lc.client_options.permissive_cache_loading && !lc.client_options.read_only {
        return Err(RepoError::PermissiveCacheLoadingRequiresReadOnly);
    }

    open_direct(&config_file, &lc, password, options).await
}

/// Connect the storage named in `lc` and open the repository in it. The
/// storage is closed again if opening fails.
pub async fn open_direct(
    config_file: &Path,
    lc: &LocalConfig,
    password: &str,
    options: Options,
) -> Result<DirectRepository> {
    let storage_config = lc.storage.clone().ok_or(RepoError::StorageNotConfigured)?;
    let base: SharedStorage = Arc::new(
        ObjectStoreStorage::new(storage_config)
            .await
            .map_err(RepoError::OpenStorage)?,
    );

    let client_options = lc
        .client_options
        .clone()
        .apply_defaults(&format!("Repository in {}", base.display_name()));
    let caching = lc.caching.clone().unwrap_or_default();

    match open_with_config(
        base.clone(),
        client_options,
        caching,
        password,
        options,
        Some(config_file),
    )
    .await
    {
        Ok(repo) => Ok(repo),
        Err(e) => {
            if let Err(close_err) = base.close().await {
                tracing::warn!(error = %close_err, "error closing storage after failed open");
            }
            Err(e)
        }
    }
}

/// Transport stage of the storage chain, innermost first: metrics, then
/// tracing and read-only enforcement when enabled.
pub fn transport_chain(
    base: SharedStorage,
    metrics: Arc<MetricsRegistry>,
    trace_storage: bool,
    read_only: bool,
) -> SharedStorage {
    StorageChain::new()
        .with(Layer::Metrics(metrics))
        .with_if(trace_storage, || Layer::Tracing {
            prefix: DEFAULT_TRACE_PREFIX.to_string(),
        })
        .with_if(read_only, || Layer::ReadOnly)
        .build(base)
}

/// Open the repository stored in `base`.
pub async fn open_with_config(
    base: SharedStorage,
    client_options: ClientOptions,
    caching: CachingOptions,
    password: &str,
    options: Options,
    config_file: Option<&Path>,
) -> Result<DirectRepository> {
    let metrics = Arc::new(MetricsRegistry::new());
    let storage = transport_chain(
        base,
        metrics.clone(),
        options.trace_storage,
        client_options.read_only,
    );

    let manager = Manager::open(
        storage.clone(),
        password,
        ManagerOptions {
            cache_duration: client_options.format_blob_cache_duration(),
            time_now: options.time_now(),
        },
    )
    .await?;

    open_with_format(
        FormatConnection {
            storage,
            format: Arc::new(manager),
            metrics,
        },
        client_options,
        caching,
        password,
        options,
        config_file,
    )
    .await
}

/// A transport-stage storage and the format metadata read through it.
#[derive(Debug, Clone)]
pub struct FormatConnection {
    pub storage: SharedStorage,
    pub format: Arc<dyn FormatProvider>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Finish opening once the format is available.
pub async fn open_with_format(
    conn: FormatConnection,
    client_options: ClientOptions,
    caching: CachingOptions,
    password: &str,
    options: Options,
    config_file: Option<&Path>,
) -> Result<DirectRepository> {
    let FormatConnection {
        storage,
        format,
        metrics,
    } = conn;
    let time_now = options.time_now();

    let required = format.required_features().await?;
    check_required_features(
        &required,
        SUPPORTED_FEATURES,
        options.test_only_ignore_missing_required_features,
    )?;

    let secrets = CacheSecrets::derive_blocking(password, format.as_ref(), options.cache_key_params).await?;

    let limits = client_options
        .throttling
        .unwrap_or_else(|| throttling_limits_from_connection_info(&storage.connection_info()));
    let throttler = Arc::new(Throttler::new(
        limits,
        THROTTLING_WINDOW,
        THROTTLE_BUCKET_INITIAL_FILL,
    )?);
    if let Some(path) = config_file {
        throttler.on_update(persist_throttling_limits(path.to_path_buf()));
    }

    let cancel = options.cancel.child_token();
    let mut chain = StorageChain::new().with(Layer::Throttling {
        throttler: throttler.clone(),
        mode: client_options.throttle_mode,
        cancel: cancel.clone(),
    });

    let blob_cfg = format.blob_cfg().await?;
    if let (true, Some(mode), Some(period)) = (
        blob_cfg.is_retention_enabled(),
        blob_cfg.retention_mode,
        blob_cfg.retention_period,
    ) {
        tracing::debug!(mode = mode.as_str(), ?period, "blob retention enabled");
        chain = chain.with(Layer::Retention {
            mode,
            period,
            prefixes: retention_protected_prefixes(),
        });
    }

    let permissive = client_options.permissive_cache_loading;
    wait_for_upgrade_lock(
        format.as_ref(),
        &time_now,
        WaitOptions {
            owner_id: &options.upgrade_owner_id,
            permissive,
            do_not_wait: options.do_not_wait_for_upgrade,
            backoff: &options.upgrade_backoff,
            cancel: &options.cancel,
        },
    )
    .await?;

    let monitor = (!permissive).then(|| {
        Arc::new(UpgradeLockMonitor::new(
            format.clone(),
            options.upgrade_owner_id.clone(),
            time_now.clone(),
            options.fatal_error_handler(),
            options.test_only_ignore_missing_required_features,
        ))
    });
    if let Some(m) = &monitor {
        chain = chain.with(Layer::BeforeOp(m.clone()));
    }

    tracing::debug!(layers = ?chain.names(), "storage chain ready");
    let storage = chain.build(storage);

    let shared = Arc::new(SharedManager::new(
        storage,
        format,
        caching,
        &secrets,
        metrics.clone(),
    )?);

    let closer = Arc::new(RefCountedCloser::new());
    {
        let metrics = metrics.clone();
        closer.register(move || async move {
            metrics.close();
            Ok(())
        })?;
    }
    {
        let shared = shared.clone();
        closer.register(move || async move { shared.close_shared().await.map_err(BoxError::from) })?;
    }
    {
        let cancel = cancel.clone();
        closer.register(move || async move {
            cancel.cancel();
            Ok(())
        })?;
    }
    {
        let metrics = metrics.clone();
        closer.register_early_close(move || async move {
            metrics.log_summary();
            Ok(())
        })?;
    }
    if let Some(configs) = options.debug_dump.clone().filter(|c| !c.is_empty()) {
        let metrics = metrics.clone();
        let throttler = throttler.clone();
        closer.register_early_close(move || async move {
            write_dumps(&configs, &metrics, &throttler, &mut std::io::stderr())
                .map(|_| ())
                .map_err(BoxError::from)
        })?;
    }

    let repo = DirectRepository::new(Parts {
        shared,
        throttler,
        monitor,
        closer,
        client_options,
        config_file: config_file.map(Path::to_path_buf),
        time_now,
        cancel,
    });
    tracing::info!(
        unique_id = %repo.unique_id(),
        read_only = repo.is_read_only(),
        "repository opened"
    );
    Ok(repo)
}

/// Throttling limits advertised in a storage's connection info. Anything
/// that does not parse, or parses to invalid rates, yields no limits.
pub fn throttling_limits_from_connection_info(ci: &ConnectionInfo) -> Limits {
    let limits = match serde_json::from_value::<Limits>(ci.config.clone()) {
        Ok(limits) => limits,
        Err(e) => {
            tracing::debug!(kind = %ci.kind, error = %e, "unable to deserialize throttling limits from connection info");
            return Limits::default();
        }
    };
    if let Err(e) = limits.validate() {
        tracing::debug!(kind = %ci.kind, error = %e, "ignoring invalid throttling limits from connection info");
        return Limits::default();
    }
    tracing::debug!(kind = %ci.kind, ?limits, "throttling limits from connection info");
    limits
}

/// Persist updated limits into the config file at `path`.
fn persist_throttling_limits(path: PathBuf) -> UpdateCallback {
    Box::new(move |limits: &Limits| {
        let mut lc = LocalConfig::load_from_file(&path)?;
        lc.client_options.throttling = Some(*limits);
        lc.write_to_file(&path)?;
        tracing::info!(config_file = %path.display(), "throttling limits saved");
        Ok::<(), BoxError>(())
    })
}
