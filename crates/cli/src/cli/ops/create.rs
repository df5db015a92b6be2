use std::path::PathBuf;

use clap::Args;

use blob::{ObjectStoreConfig, ObjectStoreStorage, Storage, StorageConfig};
use repo::format::{FormatError, InitOptions, Manager};
use repo::{ClientOptions, ConfigError, LocalConfig};

/// Initialize a repository in a local directory and connect to it.
#[derive(Args, Debug, Clone)]
pub struct Create {
    /// Directory holding the repository blobs
    #[arg(long)]
    pub path: PathBuf,

    /// Human-readable description stored in the connection config
    #[arg(long)]
    pub description: Option<String>,

    /// Connect read-only
    #[arg(long)]
    pub read_only: bool,

    /// Overwrite an existing connection config
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Context(#[from] crate::cli::op::ContextError),

    #[error("config file already exists: {0} (use --force to overwrite)")]
    ConfigExists(PathBuf),

    #[error("invalid repository path: {0}")]
    Path(#[from] std::io::Error),

    #[error("unable to open storage: {0}")]
    Storage(#[from] blob::BlobError),

    #[error("unable to initialize repository: {0}")]
    Format(#[from] FormatError),

    #[error("unable to write config: {0}")]
    Config(#[from] ConfigError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Create {
    type Error = CreateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let password = ctx.password()?;
        if ctx.config_path().exists() && !self.force {
            return Err(CreateError::ConfigExists(ctx.config_path().to_path_buf()));
        }

        let path = std::path::absolute(&self.path)?;
        let storage = StorageConfig::from(ObjectStoreConfig::Filesystem { path: path.clone() });
        let base = ObjectStoreStorage::new(storage.clone()).await?;
        let initialized = Manager::initialize(&base, password, InitOptions::default()).await;
        base.close().await?;
        initialized?;

        let client_options = ClientOptions {
            description: self.description.clone().unwrap_or_default(),
            read_only: self.read_only,
            ..Default::default()
        };
        let config = LocalConfig {
            storage: Some(storage),
            caching: None,
            client_options,
        };
        config.write_to_file(ctx.config_path())?;

        Ok(format!(
            "Created repository in {}\nConfig written to {}",
            path.display(),
            ctx.config_path().display()
        ))
    }
}
