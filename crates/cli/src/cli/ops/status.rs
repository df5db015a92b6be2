use clap::Args;

use blob::throttling::{BucketKind, Limits};
use repo::{DirectRepository, Options, RepoError};

use crate::cli::op::OpenError;

/// Connect to the repository and describe it.
#[derive(Args, Debug, Clone)]
pub struct Status {
    /// Fail instead of waiting when an upgrade lock is held
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Status {
    type Error = StatusError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let options = Options {
            do_not_wait_for_upgrade: self.no_wait,
            ..Default::default()
        };
        let repo = ctx.open(options).await?;
        let described = describe(&repo).await;
        repo.close().await?;
        Ok(described?)
    }
}

async fn describe(repo: &DirectRepository) -> Result<String, RepoError> {
    let format = repo.format();
    let mut lines = vec![
        format!("Description:  {}", repo.description()),
        format!("Storage:      {}", repo.blobs().display_name()),
        format!("Unique ID:    {}", repo.unique_id()),
        format!("Read-only:    {}", repo.is_read_only()),
        format!("Config file:  {}", display_opt(repo.config_file().map(|p| p.display()))),
    ];

    lines.push("Required features:".to_string());
    for f in format.required_features().await? {
        let suffix = if f.if_not_understood.warn { " (warn only)" } else { "" };
        lines.push(format!("  {}{}", f.feature, suffix));
    }

    match format.upgrade_lock_intent().await? {
        Some(intent) => {
            let (locked, drained) = intent.is_locked(repo.time());
            lines.push(format!(
                "Upgrade lock: held by {} since {} (locked: {}, drained: {})",
                intent.owner_id, intent.creation_time, locked, drained
            ));
        }
        None => lines.push("Upgrade lock: none".to_string()),
    }

    let blob_cfg = format.blob_cfg().await?;
    if blob_cfg.is_retention_enabled() {
        lines.push(format!(
            "Retention:    {:?} for {:?}",
            blob_cfg.retention_mode, blob_cfg.retention_period
        ));
    }

    lines.push("Throttling:".to_string());
    lines.extend(limit_lines(&repo.throttler().limits()));

    Ok(lines.join("\n"))
}

fn display_opt(v: Option<impl std::fmt::Display>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub(crate) fn limit_lines(limits: &Limits) -> Vec<String> {
    BucketKind::ALL
        .iter()
        .map(|kind| {
            let rate = limits.rate(*kind);
            let shown = if rate == 0.0 {
                "unlimited".to_string()
            } else {
                format!("{rate}/s")
            };
            format!("  {:<16} {}", kind.as_str(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_lines_mark_unlimited() {
        let lines = limit_lines(&Limits {
            reads_per_second: 2.5,
            ..Default::default()
        });
        assert_eq!(lines.len(), BucketKind::ALL.len());
        assert!(lines.iter().any(|l| l.contains("2.5/s")));
        assert_eq!(lines.iter().filter(|l| l.ends_with("unlimited")).count(), 4);
    }
}
