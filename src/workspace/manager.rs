//! Branch and worktree lifecycle per feature.
//!
//! A [`Workspace`] is where one feature is built: the project checkout on a
//! fresh branch (chained), a separate worktree off the base branch
//! (independent), or the checkout as-is (sequential). Dirty state is always
//! stashed before anything moves, and failed attempts that committed are
//! kept on a rescue branch before the workspace is reset.

use super::git::Git;
use crate::errors::LoopError;
use crate::roadmap::Feature;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Prefix for every branch the loop creates.
pub const BRANCH_PREFIX: &str = "auto-sdd";

/// Isolation for a single pass of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    Chained,
    Independent,
    Sequential,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Chained => write!(f, "chained"),
            IsolationMode::Independent => write!(f, "independent"),
            IsolationMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Where a feature is being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub dir: PathBuf,
    /// `None` in sequential mode.
    pub branch: Option<String>,
    /// Commit every retry resets to.
    pub start_sha: String,
    pub worktree: bool,
}

impl Workspace {
    pub fn label(&self) -> String {
        match &self.branch {
            Some(b) if self.worktree => format!("{} ({})", b, self.dir.display()),
            Some(b) => b.clone(),
            None => "current checkout".to_string(),
        }
    }
}

/// Free-space query, [`disk_space`] outside tests.
pub type SpaceQuery = fn(&Path) -> std::io::Result<u64>;

/// Bytes available to unprivileged users on the filesystem holding `dir`.
pub fn disk_space(dir: &Path) -> std::io::Result<u64> {
    fs2::available_space(dir)
}

pub struct BranchManager<G: Git> {
    git: G,
    project_dir: PathBuf,
    base_branch: String,
    worktree_root: PathBuf,
    min_free_gb: u64,
    last_successful: Option<String>,
    space_query: SpaceQuery,
}

impl<G: Git> BranchManager<G> {
    pub fn new(
        git: G,
        project_dir: impl Into<PathBuf>,
        base_branch: impl Into<String>,
        worktree_root: impl Into<PathBuf>,
        min_free_gb: u64,
    ) -> Self {
        Self {
            git,
            project_dir: project_dir.into(),
            base_branch: base_branch.into(),
            worktree_root: worktree_root.into(),
            min_free_gb,
            last_successful: None,
            space_query: disk_space,
        }
    }

    pub fn with_space_query(mut self, query: SpaceQuery) -> Self {
        self.space_query = query;
        self
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Branch the next chained feature starts from.
    pub fn last_successful(&self) -> Option<&str> {
        self.last_successful.as_deref()
    }

    /// Restore the chain pointer, e.g. from a resume checkpoint.
    pub fn set_last_successful(&mut self, branch: Option<String>) {
        self.last_successful = branch;
    }

    /// Stash uncommitted changes in `dir`, if any.
    pub async fn stash_if_dirty(&self, dir: &Path, reason: &str) -> Result<bool> {
        let message = format!("{}: {}", BRANCH_PREFIX, reason);
        let stashed = self.git.stash(dir, &message).await?;
        if stashed {
            warn!(dir = %dir.display(), "Stashed uncommitted changes ({})", reason);
        }
        Ok(stashed)
    }

    async fn unique_branch(&self, base: &str) -> Result<String> {
        if !self.git.branch_exists(&self.project_dir, base).await? {
            return Ok(base.to_string());
        }
        for n in 2..1000 {
            let candidate = format!("{}-{}", base, n);
            if !self.git.branch_exists(&self.project_dir, &candidate).await? {
                return Ok(candidate);
            }
        }
        anyhow::bail!("Could not find a free branch name for {}", base)
    }

    fn unique_worktree_path(&self, name: &str) -> PathBuf {
        let first = self.worktree_root.join(name);
        if !first.exists() {
            return first;
        }
        (2..)
            .map(|n| self.worktree_root.join(format!("{}-{}", name, n)))
            .find(|p| !p.exists())
            .unwrap_or(first)
    }

    /// Fail if the filesystem holding the worktree root is below the floor.
    pub fn check_disk_space(&self) -> Result<()> {
        let mut query_at = self.worktree_root.as_path();
        while !query_at.exists() {
            match query_at.parent() {
                Some(parent) => query_at = parent,
                None => break,
            }
        }
        let available = (self.space_query)(query_at)
            .with_context(|| format!("Failed to query free space at {}", query_at.display()))?;
        let required = self.min_free_gb.saturating_mul(GIB);
        if available < required {
            return Err(LoopError::InsufficientDiskSpace {
                path: query_at.to_path_buf(),
                required_gb: self.min_free_gb,
                available_gb: available as f64 / GIB as f64,
            }
            .into());
        }
        Ok(())
    }

    /// Set up a clean workspace for `feature`. `suffix` distinguishes replay
    /// passes (e.g. `-independent`).
    pub async fn prepare(
        &mut self,
        feature: &Feature,
        mode: IsolationMode,
        suffix: &str,
    ) -> Result<Workspace> {
        let slug = format!("{}{}", feature.slug(), suffix);
        let reason = format!("uncommitted changes before {}", slug);

        let workspace = match mode {
            IsolationMode::Sequential => {
                self.stash_if_dirty(&self.project_dir, &reason).await?;
                Workspace {
                    dir: self.project_dir.clone(),
                    branch: None,
                    start_sha: self.git.head_sha(&self.project_dir).await?,
                    worktree: false,
                }
            }
            IsolationMode::Chained => {
                self.stash_if_dirty(&self.project_dir, &reason).await?;
                let from = self
                    .last_successful
                    .clone()
                    .unwrap_or_else(|| self.base_branch.clone());
                let branch = self
                    .unique_branch(&format!("{}/{}", BRANCH_PREFIX, slug))
                    .await?;
                self.git
                    .create_branch(&self.project_dir, &branch, &from)
                    .await?;
                info!(branch = %branch, from = %from, "Created chained branch");
                Workspace {
                    dir: self.project_dir.clone(),
                    branch: Some(branch),
                    start_sha: self.git.head_sha(&self.project_dir).await?,
                    worktree: false,
                }
            }
            IsolationMode::Independent => {
                self.check_disk_space()?;
                let branch = self
                    .unique_branch(&format!("{}/{}", BRANCH_PREFIX, slug))
                    .await?;
                let path = self.unique_worktree_path(&slug);
                self.git
                    .worktree_add(&self.project_dir, &path, &branch, &self.base_branch)
                    .await?;
                info!(branch = %branch, path = %path.display(), "Created worktree");
                Workspace {
                    start_sha: self.git.head_sha(&path).await?,
                    dir: path,
                    branch: Some(branch),
                    worktree: true,
                }
            }
        };
        Ok(workspace)
    }

    /// Return `workspace` to its starting commit, keeping any partial work
    /// recoverable. Returns descriptions of where that work was put.
    pub async fn reset(&self, workspace: &Workspace, tag: &str) -> Result<Vec<String>> {
        let mut recovery = Vec::new();
        if self.stash_if_dirty(&workspace.dir, tag).await? {
            recovery.push(format!("stash '{}: {}' in {}", BRANCH_PREFIX, tag, workspace.dir.display()));
        }

        let head = self.git.head_sha(&workspace.dir).await?;
        if head != workspace.start_sha {
            let rescue = self
                .unique_branch(&format!("{}/rescue/{}", BRANCH_PREFIX, crate::util::slugify(tag)))
                .await?;
            self.git.branch_at(&workspace.dir, &rescue, &head).await?;
            recovery.push(format!("branch {}", rescue));
        }

        self.git
            .reset_hard(&workspace.dir, &workspace.start_sha)
            .await?;
        self.git.clean(&workspace.dir).await?;
        Ok(recovery)
    }

    /// Record a validated feature. In chained mode its branch becomes the
    /// base for the next feature.
    pub fn mark_success(&mut self, workspace: &Workspace, mode: IsolationMode) {
        if mode == IsolationMode::Chained {
            if let Some(branch) = &workspace.branch {
                self.last_successful = Some(branch.clone());
            }
        }
    }

    /// Clean up after a feature that exhausted its retries.
    pub async fn abandon(&self, workspace: &Workspace, tag: &str) -> Result<Vec<String>> {
        let recovery = self.reset(workspace, tag).await?;
        Ok(recovery)
    }

    /// Remove a worktree once nothing needs it anymore. The branch stays.
    pub async fn release(&self, workspace: &Workspace) -> Result<()> {
        if workspace.worktree {
            self.git
                .worktree_remove(&self.project_dir, &workspace.dir)
                .await?;
        }
        Ok(())
    }

    /// Check out the chain head (or base) in the project checkout.
    pub async fn return_to_chain_head(&self) -> Result<()> {
        let target = self
            .last_successful
            .as_deref()
            .unwrap_or(&self.base_branch);
        self.git.checkout(&self.project_dir, target).await
    }
}
