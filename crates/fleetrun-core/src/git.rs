//! Git capability used to bracket session runs with commit snapshots.
//!
//! The engine only depends on the [`Git`] trait; [`GitCli`] shells out to the
//! `git` binary.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Git operations consumed by the session manager.
#[async_trait]
pub trait Git: Send + Sync {
    /// Whether `dir` lies inside a git work tree.
    async fn is_repository(&self, dir: &Path) -> bool;

    /// SHA of `HEAD` in `dir`.
    async fn current_commit_sha(&self, dir: &Path) -> Result<String>;

    /// Unified diff between two revisions.
    async fn diff(&self, dir: &Path, from: &str, to: &str) -> Result<String>;

    /// `--stat` summary between two revisions.
    async fn diff_stat(&self, dir: &Path, from: &str, to: &str) -> Result<String>;
}

/// [`Git`] implementation backed by the `git` command line tool.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub const fn new() -> Self {
        Self
    }

    async fn run(dir: &Path, args: &[&str]) -> Result<String> {
        debug!(dir = %dir.display(), ?args, "Running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git {
                command: args.join(" "),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Git for GitCli {
    async fn is_repository(&self, dir: &Path) -> bool {
        Self::run(dir, &["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok_and(|out| out.trim() == "true")
    }

    async fn current_commit_sha(&self, dir: &Path) -> Result<String> {
        Self::run(dir, &["rev-parse", "HEAD"])
            .await
            .map(|out| out.trim().to_string())
    }

    async fn diff(&self, dir: &Path, from: &str, to: &str) -> Result<String> {
        Self::run(dir, &["diff", from, to]).await
    }

    async fn diff_stat(&self, dir: &Path, from: &str, to: &str) -> Result<String> {
        Self::run(dir, &["diff", "--stat", from, to]).await
    }
}
