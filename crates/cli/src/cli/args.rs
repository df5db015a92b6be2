pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "strongbox")]
#[command(about = "Connect to and inspect strongbox repositories")]
pub struct Args {
    /// Connection config file (defaults to <config dir>/strongbox/repository.config)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    /// Repository password (falls back to STRONGBOX_PASSWORD)
    #[arg(long, global = true)]
    pub password: Option<String>,

    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,

    /// Also write daily rolling log files into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
