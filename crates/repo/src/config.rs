//! Local connection configuration, persisted as JSON next to the client.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use blob::throttling::{Limits, ThrottleMode};
use blob::StorageConfig;

use crate::error::ConfigError;
use crate::format::{duration_secs, DEFAULT_FORMAT_BLOB_CACHE_DURATION};

/// Where and how much to cache locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_cache_size_bytes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_metadata_cache_size_bytes: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Per-client settings of a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub read_only: bool,
    /// Tolerate damaged local caches. Only allowed on read-only connections.
    #[serde(default)]
    pub permissive_cache_loading: bool,
    #[serde(
        default,
        rename = "formatBlobCacheDurationSecs",
        with = "duration_secs::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub format_blob_cache_duration: Option<Duration>,
    /// Overrides the limits advertised by the storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling: Option<Limits>,
    #[serde(default)]
    pub throttle_mode: ThrottleMode,
}

impl ClientOptions {
    /// Fill unset fields. `default_description` is used when no description
    /// was given.
    pub fn apply_defaults(mut self, default_description: &str) -> Self {
        if self.hostname.is_empty() {
            self.hostname = default_hostname();
        }
        if self.username.is_empty() {
            self.username = default_username();
        }
        if self.description.is_empty() {
            self.description = default_description.to_string();
        }
        if self.format_blob_cache_duration.is_none() {
            self.format_blob_cache_duration = Some(DEFAULT_FORMAT_BLOB_CACHE_DURATION);
        }
        self
    }

    pub fn format_blob_cache_duration(&self) -> Duration {
        self.format_blob_cache_duration
            .unwrap_or(DEFAULT_FORMAT_BLOB_CACHE_DURATION)
    }
}

fn env_or(keys: &[&str], fallback: &str) -> String {
    keys.iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| fallback.to_string())
}

fn default_hostname() -> String {
    env_or(&["HOSTNAME", "COMPUTERNAME"], "localhost").to_lowercase()
}

fn default_username() -> String {
    env_or(&["USER", "USERNAME"], "nobody")
}

/// Contents of a connection config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CachingOptions>,
    #[serde(flatten)]
    pub client_options: ClientOptions,
}

impl LocalConfig {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage: Some(storage),
            ..Default::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the config atomically: the JSON goes to a temporary file in the
    /// target directory which is then renamed over `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self).map_err(ConfigError::Serialize)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// Absolute form of `path`, resolved against the working directory.
pub fn absolute_config_path(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::ResolvePath {
        path: path.to_path_buf(),
        source,
    })
}
