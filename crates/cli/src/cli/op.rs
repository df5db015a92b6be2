use std::error::Error;
use std::path::{Path, PathBuf};

use repo::{DirectRepository, Options, RepoError};

/// Environment variable consulted when no `--password` is given.
pub const PASSWORD_ENV: &str = "STRONGBOX_PASSWORD";

const DEFAULT_CONFIG_FILE: &str = "repository.config";

/// Default location of the connection config: `<config dir>/strongbox/repository.config`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strongbox")
        .join(DEFAULT_CONFIG_FILE)
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no password given, pass --password or set {PASSWORD_ENV}")]
    MissingPassword,
}

#[derive(Debug, Clone)]
pub struct OpContext {
    /// Connection config file
    pub config_path: PathBuf,
    password: Option<String>,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>, password: Option<String>) -> Self {
        Self {
            config_path: config_path.unwrap_or_else(default_config_path),
            password: password.or_else(|| std::env::var(PASSWORD_ENV).ok()),
        }
    }

    pub fn password(&self) -> Result<&str, ContextError> {
        self.password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ContextError::MissingPassword)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Open the repository named by the config file.
    pub async fn open(&self, options: Options) -> Result<DirectRepository, OpenError> {
        let password = self.password()?;
        Ok(repo::open(&self.config_path, password, options).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::cli::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::cli::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => {
                            op.execute(ctx).await
                                .map(OpOutput::$variant)
                                .map_err(OpError::$variant)
                        },
                    )*
                }
            }
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        OpOutput::$variant(output) => write!(f, "{}", output),
                    )*
                }
            }
        }
    };
}
