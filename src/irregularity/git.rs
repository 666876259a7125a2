//! Commit history retrieval through the `git` binary

use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::commits::{parse_git_log, CommitRecord, GIT_LOG_FORMAT};
use super::HistoryError;

/// Source of commit records for a repository
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Commits of `repo_url`, oldest first
    async fn commits(&self, repo_url: &str) -> Result<Vec<CommitRecord>, HistoryError>;
}

/// Clones the repository into a temporary directory and reads `git log`
pub struct GitHistorySource {
    timeout: Duration,
}

impl Default for GitHistorySource {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

impl GitHistorySource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn git(&self, args: &[&str]) -> Result<String, HistoryError> {
        debug!("git {}", args.join(" "));
        let mut command = Command::new("git");
        command.args(args);
        let output = output_within(&mut command, self.timeout).await?;

        if !output.status.success() {
            return Err(HistoryError::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Run to completion. A timed-out child is killed, not left running.
async fn output_within(command: &mut Command, limit: Duration) -> Result<Output, HistoryError> {
    command.kill_on_drop(true);
    tokio::time::timeout(limit, command.output())
        .await
        .map_err(|_| HistoryError::Timeout(limit.as_secs()))?
        .map_err(|e| HistoryError::Git(format!("failed to run git: {}", e)))
}

/// `https://host/owner/repo(.git)` -> clone URL ending in `.git`
pub fn clone_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let base = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    format!("{}.git", base)
}

#[async_trait]
impl HistorySource for GitHistorySource {
    async fn commits(&self, repo_url: &str) -> Result<Vec<CommitRecord>, HistoryError> {
        let dir = tempfile::Builder::new()
            .prefix("judge-history-")
            .tempdir()
            .map_err(|e| HistoryError::Git(format!("failed to create temp dir: {}", e)))?;
        let path = dir.path().to_string_lossy().to_string();
        let url = clone_url(repo_url);

        info!("Analyzing commit history for {}", repo_url);
        self.git(&["clone", "--quiet", "--no-checkout", &url, &path])
            .await?;

        let format = format!("--format={}", GIT_LOG_FORMAT);
        let log = self
            .git(&["-C", &path, "log", "--all", &format, "--numstat"])
            .await?;

        let commits = parse_git_log(&log)?;
        debug!("Parsed {} commits from {}", commits.len(), repo_url);
        Ok(commits)
    }
}
