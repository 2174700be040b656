//! Git operations the loop needs, behind a trait.
//!
//! `GitCli` shells out to `git` with tokio, which keeps worktree and stash
//! semantics identical to what a human would get recovering by hand.

use crate::errors::LoopError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Git: Send + Sync {
    async fn current_branch(&self, dir: &Path) -> Result<String>;
    async fn head_sha(&self, dir: &Path) -> Result<String>;
    async fn is_clean(&self, dir: &Path) -> Result<bool>;
    async fn branch_exists(&self, dir: &Path, branch: &str) -> Result<bool>;
    /// Stash tracked and untracked changes. Returns `false` if there was
    /// nothing to stash.
    async fn stash(&self, dir: &Path, message: &str) -> Result<bool>;
    /// `git checkout -b branch from`.
    async fn create_branch(&self, dir: &Path, branch: &str, from: &str) -> Result<()>;
    async fn checkout(&self, dir: &Path, branch: &str) -> Result<()>;
    /// Create `branch` pointing at `sha` without checking it out.
    async fn branch_at(&self, dir: &Path, branch: &str, sha: &str) -> Result<()>;
    async fn reset_hard(&self, dir: &Path, sha: &str) -> Result<()>;
    async fn clean(&self, dir: &Path) -> Result<()>;
    async fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, from: &str) -> Result<()>;
    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()>;
    /// Stage everything and commit. Returns `false` if there was nothing to
    /// commit.
    async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool>;
    /// Add `patterns` to the repository-local exclude file.
    async fn ensure_excluded(&self, dir: &Path, patterns: &[&str]) -> Result<()>;
}

/// [`Git`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        debug!(dir = %dir.display(), "git {}", args.join(" "));
        let output = match Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !dir.exists() => {
                return Err(e).with_context(|| format!("Directory {} does not exist", dir.display()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoopError::MissingTool {
                    tool: self.program.clone(),
                }
                .into());
            }
            Err(e) => return Err(e).context("Failed to run git"),
        };

        if !output.status.success() {
            return Err(LoopError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Git for GitCli {
    async fn current_branch(&self, dir: &Path) -> Result<String> {
        self.run(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn head_sha(&self, dir: &Path) -> Result<String> {
        self.run(dir, &["rev-parse", "HEAD"]).await
    }

    async fn is_clean(&self, dir: &Path) -> Result<bool> {
        let status = self.run(dir, &["status", "--porcelain"]).await?;
        Ok(status.is_empty())
    }

    async fn branch_exists(&self, dir: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        match self
            .run(dir, &["show-ref", "--verify", "--quiet", &reference])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.downcast_ref::<LoopError>(), Some(LoopError::Git { .. })) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn stash(&self, dir: &Path, message: &str) -> Result<bool> {
        if self.is_clean(dir).await? {
            return Ok(false);
        }
        self.run(dir, &["stash", "push", "--include-untracked", "-m", message])
            .await?;
        Ok(true)
    }

    async fn create_branch(&self, dir: &Path, branch: &str, from: &str) -> Result<()> {
        self.run(dir, &["checkout", "-b", branch, from]).await?;
        Ok(())
    }

    async fn checkout(&self, dir: &Path, branch: &str) -> Result<()> {
        self.run(dir, &["checkout", branch]).await?;
        Ok(())
    }

    async fn branch_at(&self, dir: &Path, branch: &str, sha: &str) -> Result<()> {
        self.run(dir, &["branch", branch, sha]).await?;
        Ok(())
    }

    async fn reset_hard(&self, dir: &Path, sha: &str) -> Result<()> {
        self.run(dir, &["reset", "--hard", sha]).await?;
        Ok(())
    }

    async fn clean(&self, dir: &Path) -> Result<()> {
        self.run(dir, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, from: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.run(repo, &["worktree", "add", "-b", branch, path_str, from])
            .await?;
        Ok(())
    }

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.run(repo, &["worktree", "remove", "--force", path_str])
            .await?;
        Ok(())
    }

    async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool> {
        self.run(dir, &["add", "-A"]).await?;
        let staged = self.run(dir, &["diff", "--cached", "--name-only"]).await?;
        if staged.is_empty() {
            return Ok(false);
        }
        self.run(dir, &["commit", "-m", message]).await?;
        Ok(true)
    }

    async fn ensure_excluded(&self, dir: &Path, patterns: &[&str]) -> Result<()> {
        let raw = self
            .run(dir, &["rev-parse", "--git-path", "info/exclude"])
            .await?;
        let mut exclude = PathBuf::from(raw);
        if exclude.is_relative() {
            exclude = dir.join(exclude);
        }
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        let missing: Vec<&str> = patterns
            .iter()
            .copied()
            .filter(|p| !existing.lines().any(|l| l.trim() == *p))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for p in missing {
            content.push_str(p);
            content.push('\n');
        }
        std::fs::write(&exclude, content)
            .with_context(|| format!("Failed to update {}", exclude.display()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;

    /// Initialise a repository with one commit on `main`.
    pub fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@localhost")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@localhost")
                .output()
                .unwrap();
            assert!(status.status.success(), "git {:?} failed: {:?}", args, status);
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@localhost"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "initial"]);
    }
}
