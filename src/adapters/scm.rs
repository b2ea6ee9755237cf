//! Source control access: revision reference resolution.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::SourceControl;

/// Resolves references with `git rev-parse` inside a repository
pub struct GitSourceControl {
    repository: PathBuf,
}

impl GitSourceControl {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
        }
    }
}

#[async_trait]
impl SourceControl for GitSourceControl {
    fn name(&self) -> &str {
        "git"
    }

    async fn resolve(&self, reference: &str) -> Result<String> {
        if reference.starts_with('-') {
            anyhow::bail!("Refusing revision reference that looks like an option: {}", reference);
        }

        let output = Command::new("git")
            .args(["rev-parse", "--verify", &format!("{}^{{commit}}", reference)])
            .current_dir(&self.repository)
            .output()
            .await
            .with_context(|| format!("Failed to run git in {}", self.repository.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Cannot resolve revision '{}': {}", reference, stderr.trim());
        }

        let commit = String::from_utf8(output.stdout)
            .context("git output is not valid UTF-8")?
            .trim()
            .to_string();

        if commit.is_empty() {
            anyhow::bail!("git returned no commit for '{}'", reference);
        }

        Ok(commit)
    }
}

/// Uses references verbatim (no repository configured)
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRevisions;

#[async_trait]
impl SourceControl for PassthroughRevisions {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn resolve(&self, reference: &str) -> Result<String> {
        if reference.trim().is_empty() {
            anyhow::bail!("Revision reference cannot be empty");
        }
        Ok(reference.to_string())
    }
}
