//! The eval sidecar: watches HEAD and evaluates each new commit.
//!
//! The sidecar only reads the repository. Its output goes to the eval output
//! directory, which lives under the git-excluded `logs/`. Every failure is
//! logged and the commit skipped; nothing here stops the loop.
//!
//! A drain is requested either through the cancellation token (INT/TERM) or
//! by the build process creating [`DRAIN_SENTINEL`] in the project root. On
//! drain, commits that landed since the last poll are evaluated, the campaign
//! summary is written and the sentinel is removed.

use super::campaign::write_campaign;
use super::mechanical::{commit_diff, run_mechanical_eval};
use super::record::EvalRecord;
use crate::agent::{Agent, AgentRequest, AgentStep, KeywordClassifier, OutputClassifier};
use crate::context::truncate_text;
use crate::errors::EvalError;
use crate::prompts;
use git2::{Repository, Sort};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File whose presence asks a running sidecar to drain and exit.
pub const DRAIN_SENTINEL: &str = ".sdd-eval-drain";

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub project_dir: PathBuf,
    pub output_dir: PathBuf,
    pub interval: Duration,
    pub model: Option<String>,
    pub max_context_tokens: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarStats {
    pub evaluated: usize,
    pub errors: usize,
    pub agent_disabled: bool,
    pub campaign: Option<PathBuf>,
}

pub fn sentinel_path(project_dir: &Path) -> PathBuf {
    project_dir.join(DRAIN_SENTINEL)
}

fn head_sha(project_dir: &Path) -> Result<String, EvalError> {
    let repo = Repository::open(project_dir)?;
    let head = repo.head().map_err(|_| EvalError::NoHead)?;
    let commit = head.peel_to_commit().map_err(|_| EvalError::NoHead)?;
    Ok(commit.id().to_string())
}

/// Non-merge commits reachable from `to` but not `from`, oldest first.
pub fn new_commits(project_dir: &Path, from: &str, to: &str) -> Result<Vec<String>, EvalError> {
    let repo = Repository::open(project_dir)?;
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    walk.push(git2::Oid::from_str(to)?)?;
    walk.hide(git2::Oid::from_str(from)?)?;

    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid?;
        if repo.find_commit(oid)?.parent_count() > 1 {
            continue;
        }
        commits.push(oid.to_string());
    }
    Ok(commits)
}

fn read_optional(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub struct EvalSidecar<A: Agent> {
    config: SidecarConfig,
    agent: Option<A>,
    classifier: KeywordClassifier,
    stats: SidecarStats,
}

impl<A: Agent> EvalSidecar<A> {
    /// `agent` is `None` for mechanical-only evaluation.
    pub fn new(config: SidecarConfig, agent: Option<A>) -> Self {
        Self {
            config,
            agent,
            classifier: KeywordClassifier::default(),
            stats: SidecarStats::default(),
        }
    }

    fn draining(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || sentinel_path(&self.config.project_dir).is_file()
    }

    /// Poll until a drain is requested, then finish up.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SidecarStats, EvalError> {
        let sentinel = sentinel_path(&self.config.project_dir);
        if sentinel.is_file() {
            info!("Removing stale drain sentinel");
            std::fs::remove_file(&sentinel).map_err(|source| EvalError::Io {
                path: sentinel.clone(),
                source,
            })?;
        }
        std::fs::create_dir_all(&self.config.output_dir).map_err(|source| EvalError::Io {
            path: self.config.output_dir.clone(),
            source,
        })?;

        let mut last = head_sha(&self.config.project_dir)?;
        info!(
            head = %&last[..last.len().min(8)],
            interval_secs = self.config.interval.as_secs(),
            agent = self.agent.is_some(),
            "Eval sidecar watching"
        );

        loop {
            let mut draining = self.draining(&cancel);
            if !draining {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
                draining = self.draining(&cancel);
            }
            if draining {
                info!("Drain requested, evaluating remaining commits");
            }

            match head_sha(&self.config.project_dir) {
                Ok(head) if head != last => {
                    match new_commits(&self.config.project_dir, &last, &head) {
                        Ok(commits) => {
                            for sha in commits {
                                self.evaluate(&sha).await;
                            }
                        }
                        Err(e) => {
                            warn!("Could not list commits {}..{}: {}", last, head, e);
                            self.stats.errors += 1;
                        }
                    }
                    last = head;
                }
                Ok(_) => debug!("HEAD unchanged"),
                Err(e) => warn!("Could not read HEAD: {}", e),
            }

            if draining {
                break;
            }
        }

        match write_campaign(&self.config.output_dir) {
            Ok(path) => self.stats.campaign = path,
            Err(e) => warn!("Failed to write campaign summary: {:#}", e),
        }
        if sentinel.is_file()
            && let Err(e) = std::fs::remove_file(&sentinel)
        {
            warn!("Could not remove drain sentinel: {}", e);
        }
        info!(
            evaluated = self.stats.evaluated,
            errors = self.stats.errors,
            "Eval sidecar finished"
        );
        Ok(self.stats)
    }

    /// Evaluate one commit. Never fails: problems are logged and counted.
    pub async fn evaluate(&mut self, sha: &str) {
        let short = &sha[..sha.len().min(8)];
        let mechanical = match Repository::open(&self.config.project_dir)
            .map_err(EvalError::from)
            .and_then(|repo| run_mechanical_eval(&repo, sha))
        {
            Ok(m) => m,
            Err(e) => {
                warn!(commit = short, "Mechanical eval failed, skipping: {}", e);
                self.stats.errors += 1;
                return;
            }
        };
        if mechanical.evaluated().is_none() {
            info!(commit = short, "Skipped merge commit");
            return;
        }

        let agent_output = self.agent_pass(sha).await;
        let record = EvalRecord::new(mechanical, agent_output.as_deref());
        match record.write(&self.config.output_dir) {
            Ok(path) => {
                self.stats.evaluated += 1;
                info!(commit = short, path = %path.display(), "Eval complete");
            }
            Err(e) => {
                warn!(commit = short, "Failed to write eval result: {:#}", e);
                self.stats.errors += 1;
            }
        }
    }

    fn prompt_for(&self, sha: &str) -> Result<String, EvalError> {
        let repo = Repository::open(&self.config.project_dir)?;
        let diff = commit_diff(&repo, sha)?;
        let diff = truncate_text(&diff, self.config.max_context_tokens, "diff");
        let claude_md = read_optional(&self.config.project_dir.join("CLAUDE.md"));
        let learnings = read_optional(&self.config.project_dir.join(".specs/learnings/index.md"));
        Ok(prompts::eval_prompt(sha, &diff, &claude_md, &learnings))
    }

    async fn agent_pass(&mut self, sha: &str) -> Option<String> {
        if self.stats.agent_disabled {
            return None;
        }
        let agent = self.agent.as_ref()?;
        let short = &sha[..sha.len().min(8)];

        let prompt = match self.prompt_for(sha) {
            Ok(p) => p,
            Err(e) => {
                warn!(commit = short, "Could not build eval prompt, mechanical only: {}", e);
                self.stats.errors += 1;
                return None;
            }
        };
        let request = AgentRequest::new(AgentStep::Eval, prompt, &self.config.project_dir)
            .with_model(self.config.model.clone())
            .with_label(format!("eval-{}", short));

        match agent.invoke(&request).await {
            Ok(output) if output.exit_code == 0 => Some(output.searchable().to_string()),
            Ok(output) if self.classifier.is_credit_exhausted(&output.raw) => {
                warn!("API credits exhausted; agent evals disabled for the rest of this run");
                self.stats.agent_disabled = true;
                None
            }
            Ok(output) => {
                warn!(commit = short, exit_code = output.exit_code, "Agent eval failed, mechanical only");
                self.stats.errors += 1;
                None
            }
            Err(e) => {
                warn!(commit = short, "Agent eval failed, mechanical only: {:#}", e);
                self.stats.errors += 1;
                None
            }
        }
    }
}
