//! Code retrieval
//!
//! Turns a remote repository into one text document for the pipeline. The
//! default implementation shells out to a bundling command (repomix) that
//! writes an XML document with one `<file>` record per source file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::BundlerConfig;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Bundler command failed: {0}")]
    Command(String),
    #[error("Bundler I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bundler timed out after {0}s")]
    Timeout(u64),
    #[error("Bundler produced an empty document")]
    Empty,
}

impl BundleError {
    /// The repository itself is the problem; retrying will not help
    pub fn is_permanent(&self) -> bool {
        matches!(self, BundleError::Command(_) | BundleError::Empty)
    }
}

/// A bundled document on disk. Owns its temporary directory, if any, which
/// is removed when the bundle is dropped.
#[derive(Debug)]
pub struct SourceBundle {
    path: PathBuf,
    _dir: Option<TempDir>,
}

impl SourceBundle {
    /// Bundle backed by an existing file (not removed on drop)
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _dir: None,
        }
    }

    fn in_dir(dir: TempDir, path: PathBuf) -> Self {
        Self {
            path,
            _dir: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<String, BundleError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Err(BundleError::Empty);
        }
        Ok(content)
    }
}

#[async_trait]
pub trait CodeRetrieval: Send + Sync {
    async fn bundle_repository(&self, repo_url: &str) -> Result<SourceBundle, BundleError>;
}

/// Runs `<command> --remote <url> --output <tmp>/bundle.xml --style xml`
pub struct CommandBundler {
    command: String,
    timeout: Duration,
}

impl CommandBundler {
    pub fn new(config: &BundlerConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl CodeRetrieval for CommandBundler {
    async fn bundle_repository(&self, repo_url: &str) -> Result<SourceBundle, BundleError> {
        let dir = tempfile::Builder::new().prefix("judge-bundle-").tempdir()?;
        let output_path = dir.path().join("bundle.xml");

        info!("Bundling repository {}", repo_url);
        let mut command = Command::new(&self.command);
        command
            .arg("--remote")
            .arg(repo_url)
            .arg("--output")
            .arg(&output_path)
            .arg("--style")
            .arg("xml")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| BundleError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BundleError::Command(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        if !output_path.exists() {
            return Err(BundleError::Command(format!(
                "{} did not write {}",
                self.command,
                output_path.display()
            )));
        }

        debug!("Bundle written to {}", output_path.display());
        Ok(SourceBundle::in_dir(dir, output_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bundle_from_path_reads_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        std::fs::write(&path, "<file path=\"a.rs\">fn a() {}</file>").unwrap();

        let bundle = SourceBundle::from_path(&path);
        assert!(bundle.read().await.unwrap().contains("fn a()"));
    }

    #[tokio::test]
    async fn test_empty_bundle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(
            SourceBundle::from_path(&path).read().await,
            Err(BundleError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_missing_command_is_io_error() {
        let bundler = CommandBundler::new(&BundlerConfig {
            command: "definitely-not-a-real-bundler-binary".into(),
            timeout_secs: 5,
        });
        let err = bundler
            .bundle_repository("https://github.com/a/b")
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Io(_)));
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(BundleError::Command("repository not found".into()).is_permanent());
        assert!(BundleError::Empty.is_permanent());
        assert!(!BundleError::Timeout(300).is_permanent());
    }

    #[tokio::test]
    async fn test_temp_dir_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let file = root.join("bundle.xml");
        std::fs::write(&file, "content").unwrap();

        let bundle = SourceBundle::in_dir(dir, file);
        assert!(bundle.path().exists());
        drop(bundle);
        assert!(!root.exists());
    }
}
