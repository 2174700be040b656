//! Post-build validation.
//!
//! After an agent claims a feature is built, the claim is checked in order:
//! the spec file exists, the tree is clean, the project builds, the tests
//! pass, the spec has not drifted from the code, and (optionally) a review
//! pass has fixed critical issues without regressing anything. The first
//! hard failure ends validation and sends the feature back for a retry.

use super::checks::{CheckKind, CheckOutcome, CheckRunner};
use super::frontmatter::validate_frontmatter;
use crate::agent::{Agent, AgentRequest, AgentStep};
use crate::context::truncate_for_context;
use crate::errors::LoopError;
use crate::prompts;
use crate::signals::{DriftSignal, ReviewSignal, parse_drift_signal, parse_review_signal};
use crate::workspace::{BRANCH_PREFIX, Git, Workspace};
use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Which validation step rejected a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SpecFile,
    CleanTree,
    Build,
    Test,
    Drift,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::SpecFile => "spec file",
            Stage::CleanTree => "clean tree",
            Stage::Build => "build check",
            Stage::Test => "test check",
            Stage::Drift => "drift check",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub stage: Stage,
    /// Fed to the retry prompt.
    pub output: String,
}

impl ValidationFailure {
    fn new(stage: Stage, output: impl Into<String>) -> Self {
        Self {
            stage,
            output: output.into(),
        }
    }
}

/// What a build claimed to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildClaim {
    pub name: String,
    pub spec_file: String,
    pub source_files: Vec<String>,
}

/// A drift check postponed to the end-of-run batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftPair {
    pub label: String,
    pub workspace: PathBuf,
    pub spec_file: String,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub failure: Option<ValidationFailure>,
    pub test_count: Option<u32>,
    pub drift: Option<DriftSignal>,
    pub review: Option<ReviewSignal>,
    pub deferred_drift: Option<DriftPair>,
    /// Non-fatal findings worth surfacing in the summary.
    pub notes: Vec<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    fn failed(mut self, failure: ValidationFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationSettings {
    pub drift_check: bool,
    pub max_drift_retries: u32,
    pub code_review: bool,
    /// Collect drift checks for the end-of-run batch instead.
    pub defer_drift: bool,
    pub max_context_tokens: usize,
    pub drift_model: Option<String>,
    pub review_model: Option<String>,
}

pub struct Validator<'a, A: Agent, C: CheckRunner, G: Git> {
    agent: &'a A,
    checks: &'a C,
    git: &'a G,
    settings: &'a ValidationSettings,
}

fn resolve_spec(dir: &Path, spec_file: &str) -> PathBuf {
    let path = Path::new(spec_file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn check_failure(kind: CheckKind, outcome: &CheckOutcome) -> ValidationFailure {
    let stage = match kind {
        CheckKind::Build => Stage::Build,
        CheckKind::Test => Stage::Test,
    };
    let command = outcome.command.as_deref().unwrap_or("check");
    ValidationFailure::new(stage, format!("$ {}\n{}", command, outcome.output))
}

/// Build then test; the test count on success.
pub async fn verify<C: CheckRunner>(
    checks: &C,
    dir: &Path,
) -> Result<std::result::Result<Option<u32>, ValidationFailure>> {
    let build = checks.run(CheckKind::Build, dir).await?;
    if !build.passed {
        return Ok(Err(check_failure(CheckKind::Build, &build)));
    }
    let test = checks.run(CheckKind::Test, dir).await?;
    if !test.passed {
        return Ok(Err(check_failure(CheckKind::Test, &test)));
    }
    Ok(Ok(test.test_count))
}

impl<'a, A: Agent, C: CheckRunner, G: Git> Validator<'a, A, C, G> {
    pub fn new(agent: &'a A, checks: &'a C, git: &'a G, settings: &'a ValidationSettings) -> Self {
        Self {
            agent,
            checks,
            git,
            settings,
        }
    }

    pub async fn validate(&self, workspace: &Workspace, claim: &BuildClaim, label: &str) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let dir = workspace.dir.as_path();

        let spec_path = resolve_spec(dir, &claim.spec_file);
        if !spec_path.is_file() {
            return Ok(report.failed(ValidationFailure::new(
                Stage::SpecFile,
                format!(
                    "The build reported SPEC_FILE: {} but that file does not exist.",
                    claim.spec_file
                ),
            )));
        }
        if let Err(e) = validate_frontmatter(&spec_path) {
            warn!("Spec frontmatter problem: {}", e);
            report.notes.push(e.to_string());
        }

        if !self.git.is_clean(dir).await? {
            return Ok(report.failed(ValidationFailure::new(
                Stage::CleanTree,
                "The build reported success but left uncommitted changes. Commit all work before reporting FEATURE_BUILT.",
            )));
        }

        match verify(self.checks, dir).await? {
            Ok(count) => report.test_count = count,
            Err(failure) => return Ok(report.failed(failure)),
        }

        if self.settings.drift_check {
            if self.settings.defer_drift {
                report.deferred_drift = Some(DriftPair {
                    label: label.to_string(),
                    workspace: workspace.dir.clone(),
                    spec_file: claim.spec_file.clone(),
                    source_files: claim.source_files.clone(),
                });
            } else {
                let (signal, failure, count) = self.drift(dir, claim, label).await?;
                report.drift = Some(signal);
                if let Some(failure) = failure {
                    return Ok(report.failed(failure));
                }
                if count.is_some() {
                    report.test_count = count;
                }
            }
        }

        if self.settings.code_review {
            let (signal, note) = self.review(dir, claim, label).await?;
            report.review = Some(signal);
            if let Some(note) = note {
                report.notes.push(note);
            }
        }

        Ok(report)
    }

    async fn drift(
        &self,
        dir: &Path,
        claim: &BuildClaim,
        label: &str,
    ) -> Result<(DriftSignal, Option<ValidationFailure>, Option<u32>)> {
        let spec_path = resolve_spec(dir, &claim.spec_file);
        let mut last_signal = DriftSignal::Missing;
        let mut last_failure = String::new();

        for attempt in 0..=self.settings.max_drift_retries {
            if attempt > 0 {
                info!(label, attempt, "Retrying drift check");
            }
            let spec = truncate_for_context(&spec_path, self.settings.max_context_tokens);
            let prompt = prompts::drift_prompt(&claim.spec_file, &spec, &claim.source_files, true);
            let request = AgentRequest::new(AgentStep::Drift, prompt, dir)
                .with_model(self.settings.drift_model.clone())
                .with_label(label);

            let output = match self.agent.invoke(&request).await {
                Ok(output) => output,
                Err(e) if matches!(e.downcast_ref::<LoopError>(), Some(LoopError::RateLimitExhausted { .. })) => {
                    warn!(label, "Drift agent rate limited: {}", e);
                    last_failure = e.to_string();
                    continue;
                }
                Err(e) => return Err(e),
            };

            last_signal = parse_drift_signal(output.searchable());
            match &last_signal {
                DriftSignal::NoDrift => {
                    self.commit_leftovers(dir, &format!("reconcile spec drift for {}", claim.name)).await?;
                    return Ok((last_signal, None, None));
                }
                DriftSignal::Fixed { summary } => {
                    info!(label, "Drift fixed: {}", summary);
                    self.commit_leftovers(dir, &format!("reconcile spec drift for {}", claim.name)).await?;
                    match verify(self.checks, dir).await? {
                        Ok(count) => return Ok((last_signal, None, count)),
                        Err(failure) => {
                            warn!(label, "Build or tests failed after drift fix ({})", failure.stage);
                            last_failure = failure.output;
                        }
                    }
                }
                DriftSignal::Unresolvable { reason } => {
                    warn!(label, "Drift unresolvable: {}", reason);
                    last_failure = format!("DRIFT_UNRESOLVABLE: {}", reason);
                }
                DriftSignal::Missing => {
                    warn!(label, "Drift agent gave no signal");
                    last_failure = "The drift check produced no NO_DRIFT or DRIFT_FIXED signal.".to_string();
                }
            }
        }

        Ok((
            last_signal,
            Some(ValidationFailure::new(Stage::Drift, last_failure)),
            None,
        ))
    }

    async fn review(&self, dir: &Path, claim: &BuildClaim, label: &str) -> Result<(ReviewSignal, Option<String>)> {
        let before = self.git.head_sha(dir).await?;
        let prompt = prompts::review_prompt(&claim.name, &claim.source_files);
        let request = AgentRequest::new(AgentStep::Review, prompt, dir)
            .with_model(self.settings.review_model.clone())
            .with_label(label);

        let output = match self.agent.invoke(&request).await {
            Ok(output) => output,
            Err(e) if matches!(e.downcast_ref::<LoopError>(), Some(LoopError::RateLimitExhausted { .. })) => {
                warn!(label, "Review agent rate limited, skipping review: {}", e);
                let note = format!("code review skipped: {}", e);
                return Ok((ReviewSignal::Missing, Some(note)));
            }
            Err(e) => return Err(e),
        };
        let signal = parse_review_signal(output.searchable());

        let changed = !self.git.is_clean(dir).await? || self.git.head_sha(dir).await? != before;
        if !changed {
            let note = match &signal {
                ReviewSignal::Failed { reason } => Some(format!("code review failed: {}", reason)),
                ReviewSignal::Missing => Some("code review gave no signal".to_string()),
                _ => None,
            };
            return Ok((signal, note));
        }

        self.commit_leftovers(dir, &format!("code review fixes for {}", claim.name)).await?;
        match verify(self.checks, dir).await? {
            Ok(_) => Ok((signal, None)),
            Err(failure) => {
                warn!(label, "Code review regressed the {}; reverting its changes", failure.stage);
                let rescue = format!("{}/rescue/{}-review", BRANCH_PREFIX, crate::util::slugify(label));
                let head = self.git.head_sha(dir).await?;
                let kept = match self.git.branch_at(dir, &rescue, &head).await {
                    Ok(()) => rescue,
                    Err(e) => {
                        warn!("Could not keep review changes on {}: {}", rescue, e);
                        head.clone()
                    }
                };
                self.git.reset_hard(dir, &before).await?;
                self.git.clean(dir).await?;
                Ok((
                    signal,
                    Some(format!("code review regressed the {} and was reverted; its changes are on {}", failure.stage, kept)),
                ))
            }
        }
    }

    async fn commit_leftovers(&self, dir: &Path, what: &str) -> Result<()> {
        if self
            .git
            .commit_all(dir, &format!("{}: {}", BRANCH_PREFIX, what))
            .await?
        {
            info!(dir = %dir.display(), "Committed {}", what);
        }
        Ok(())
    }
}

/// Result of one batched drift check.
#[derive(Debug, Clone)]
pub struct DriftPairResult {
    pub pair: DriftPair,
    pub signal: DriftSignal,
    pub passed: bool,
    pub error: Option<String>,
}

/// Aggregate of a drift batch.
#[derive(Debug, Clone, Default)]
pub struct DriftBatchReport {
    pub results: Vec<DriftPairResult>,
    /// Workspaces whose build or tests failed after the drift edits.
    pub regressions: Vec<(PathBuf, ValidationFailure)>,
}

impl DriftBatchReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed) && self.regressions.is_empty()
    }

    pub fn failed_labels(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.pair.label.clone())
            .collect()
    }
}

/// Default pool size for the drift batch.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Drift-check every pair concurrently, at most `max_workers` at a time.
/// One pair failing never stops the others. After all have finished, each
/// touched workspace is verified once and the spec edits are committed.
pub async fn run_drift_batch<A: Agent, C: CheckRunner, G: Git>(
    agent: &A,
    checks: &C,
    git: &G,
    pairs: Vec<DriftPair>,
    settings: &ValidationSettings,
    max_workers: usize,
) -> Result<DriftBatchReport> {
    if pairs.is_empty() {
        return Ok(DriftBatchReport::default());
    }
    let workers = max_workers.clamp(1, pairs.len());
    info!(pairs = pairs.len(), workers, "Running drift checks in parallel");
    let semaphore = Arc::new(Semaphore::new(workers));

    let futures = pairs.into_iter().map(|pair| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = match semaphore.acquire().await {
                Ok(p) => p,
                Err(e) => {
                    return DriftPairResult {
                        pair,
                        signal: DriftSignal::Missing,
                        passed: false,
                        error: Some(e.to_string()),
                    };
                }
            };
            let spec_path = resolve_spec(&pair.workspace, &pair.spec_file);
            let spec = truncate_for_context(&spec_path, settings.max_context_tokens);
            let prompt = prompts::drift_prompt(&pair.spec_file, &spec, &pair.source_files, false);
            let request = AgentRequest::new(AgentStep::Drift, prompt, &pair.workspace)
                .with_model(settings.drift_model.clone())
                .with_label(&pair.label);
            match agent.invoke(&request).await {
                Ok(output) => {
                    let signal = parse_drift_signal(output.searchable());
                    let passed = matches!(signal, DriftSignal::NoDrift | DriftSignal::Fixed { .. });
                    if !passed {
                        warn!(label = %pair.label, "Parallel drift check failed");
                    }
                    DriftPairResult {
                        pair,
                        signal,
                        passed,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(label = %pair.label, "Drift check errored: {:#}", e);
                    DriftPairResult {
                        pair,
                        signal: DriftSignal::Missing,
                        passed: false,
                        error: Some(format!("{:#}", e)),
                    }
                }
            }
        }
    });
    let results = join_all(futures).await;

    let mut workspaces: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for r in &results {
        workspaces
            .entry(r.pair.workspace.clone())
            .or_default()
            .push(r.pair.label.clone());
    }

    let mut regressions = Vec::new();
    for (dir, labels) in workspaces {
        if git.is_clean(&dir).await? {
            continue;
        }
        match verify(checks, &dir).await? {
            Ok(_) => {
                let message = format!("{}: reconcile spec drift for {}", BRANCH_PREFIX, labels.join(", "));
                git.commit_all(&dir, &message).await?;
            }
            Err(failure) => {
                warn!(dir = %dir.display(), "Drift edits broke the {}; stashing them", failure.stage);
                git.stash(&dir, &format!("{}: drift batch edits for {}", BRANCH_PREFIX, labels.join(", ")))
                    .await?;
                regressions.push((dir, failure));
            }
        }
    }

    Ok(DriftBatchReport {
        results,
        regressions,
    })
}
