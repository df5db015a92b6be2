use clap::Args;

use blob::throttling::Limits;
use repo::{Options, RepoError};

use crate::cli::op::OpenError;
use super::status::limit_lines;

/// Show or change the throttling limits of the connection.
///
/// Changed limits are saved into the connection config.
#[derive(Args, Debug, Clone)]
pub struct Throttle {
    #[arg(long)]
    pub reads_per_second: Option<f64>,
    #[arg(long)]
    pub writes_per_second: Option<f64>,
    #[arg(long)]
    pub lists_per_second: Option<f64>,
    #[arg(long)]
    pub upload_bytes_per_second: Option<f64>,
    #[arg(long)]
    pub download_bytes_per_second: Option<f64>,
}

impl Throttle {
    fn is_update(&self) -> bool {
        [
            self.reads_per_second,
            self.writes_per_second,
            self.lists_per_second,
            self.upload_bytes_per_second,
            self.download_bytes_per_second,
        ]
        .iter()
        .any(Option::is_some)
    }

    /// `current` with every given flag applied.
    fn apply(&self, current: Limits) -> Limits {
        Limits {
            reads_per_second: self.reads_per_second.unwrap_or(current.reads_per_second),
            writes_per_second: self.writes_per_second.unwrap_or(current.writes_per_second),
            lists_per_second: self.lists_per_second.unwrap_or(current.lists_per_second),
            upload_bytes_per_second: self
                .upload_bytes_per_second
                .unwrap_or(current.upload_bytes_per_second),
            download_bytes_per_second: self
                .download_bytes_per_second
                .unwrap_or(current.download_bytes_per_second),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Throttle {
    type Error = ThrottleError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let repo = ctx.open(Options::default()).await?;

        let updated = if self.is_update() {
            let limits = self.apply(repo.throttler().limits());
            repo.set_throttling_limits(limits).map(|_| true)
        } else {
            Ok(false)
        };
        let limits = repo.throttler().limits();
        repo.close().await?;

        let header = if updated? {
            "Throttling limits updated:"
        } else {
            "Throttling limits:"
        };
        let mut lines = vec![header.to_string()];
        lines.extend(limit_lines(&limits));
        Ok(lines.join("\n"))
    }
}
