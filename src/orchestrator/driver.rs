//! The feature build loop.
//!
//! Features are taken strictly in resolved order. Each one gets a workspace
//! from the [`BranchManager`], then goes through
//! `branch-ready -> build-attempted -> {validated, retry, failed}`:
//!
//! - the first attempt uses the build prompt, later ones the retry prompt
//!   carrying the previous failure
//! - every retry starts from the workspace's starting commit, after a
//!   minimum delay
//! - the roadmap row reads in progress while attempts run and is committed
//!   in the workspace, so retries reset onto the marker commit
//! - a validated feature is marked complete in the roadmap, checkpointed
//!   and (when chained) becomes the base of the next feature
//! - a feature that runs out of attempts is recorded, its row goes back to
//!   pending and the loop moves on
//!
//! Quota exhaustion, missing tools and disk exhaustion end the run.

use super::state::{ResumeState, StateStore};
use super::summary::{
    BuildSummary, DriftBatchSummary, FeatureOutcome, FeatureRecord, PassSummary, StopReason,
    UnschedulableRecord,
};
use crate::agent::{Agent, AgentRequest, AgentStep, KeywordClassifier, OutputClassifier};
use crate::context::{estimate_tokens, tail_chars};
use crate::errors::LoopError;
use crate::eval::DRAIN_SENTINEL;
use crate::prompts;
use crate::roadmap::{BuildPlan, Feature, FeatureStatus, set_status};
use crate::settings::BranchStrategy;
use crate::signals::{BuildSignal, parse_build_signal};
use crate::validation::{
    BuildClaim, CheckRunner, DriftPair, ValidationSettings, Validator, run_drift_batch,
};
use crate::workspace::{BRANCH_PREFIX, BranchManager, Git, IsolationMode, Workspace};
use anyhow::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Failure output kept for the retry prompt and the summary.
const FAILURE_TAIL_CHARS: usize = 8000;

/// Progress callbacks for the console.
pub trait BuildObserver: Send + Sync {
    fn pass_started(&self, _mode: IsolationMode, _total: usize) {}
    fn feature_started(&self, _index: usize, _total: usize, _feature: &Feature) {}
    fn attempt_started(&self, _feature: &Feature, _attempt: u32, _max: u32) {}
    fn step(&self, _message: &str) {}
    fn feature_finished(&self, _record: &FeatureRecord) {}
}

pub struct NoopObserver;

impl BuildObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub strategy: BranchStrategy,
    pub max_features: usize,
    pub max_retries: u32,
    pub min_retry_delay: Duration,
    pub resume: bool,
    /// Roadmap path relative to a workspace root.
    pub roadmap: PathBuf,
    pub build_model: Option<String>,
    pub retry_model: Option<String>,
    /// Reported in the summary.
    pub model_label: String,
    pub validation: ValidationSettings,
    pub drift_parallelism: usize,
}

/// Result of a whole run. `error` is set for run-fatal stops; the summary is
/// complete either way.
pub struct RunReport {
    pub summary: BuildSummary,
    pub error: Option<anyhow::Error>,
    /// The checkpoint was left in place for `--resume`.
    pub checkpoint_kept: bool,
}

enum FeatureResult {
    Built {
        record: FeatureRecord,
        deferred: Option<DriftPair>,
        kept: Option<Workspace>,
    },
    Failed(FeatureRecord),
    NoFeaturesReady,
    Interrupted,
}

struct PassResult {
    summary: PassSummary,
    stop: StopReason,
    error: Option<anyhow::Error>,
    deferred: Vec<DriftPair>,
    kept: Vec<Workspace>,
}

pub struct BuildLoop<'a, A: Agent, C: CheckRunner, G: Git, S: StateStore> {
    agent: &'a A,
    checks: &'a C,
    branches: BranchManager<G>,
    store: &'a S,
    settings: DriverSettings,
    classifier: Box<dyn OutputClassifier>,
    observer: &'a dyn BuildObserver,
    cancel: CancellationToken,
}

impl<'a, A: Agent, C: CheckRunner, G: Git, S: StateStore> BuildLoop<'a, A, C, G, S> {
    pub fn new(
        agent: &'a A,
        checks: &'a C,
        branches: BranchManager<G>,
        store: &'a S,
        settings: DriverSettings,
    ) -> Self {
        Self {
            agent,
            checks,
            branches,
            store,
            settings,
            classifier: Box::new(KeywordClassifier::default()),
            observer: &NoopObserver,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn BuildObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn OutputClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn branches(&self) -> &BranchManager<G> {
        &self.branches
    }

    /// Load the checkpoint to continue from, if resuming.
    async fn initial_state(&mut self) -> Result<ResumeState> {
        let fresh = ResumeState::new(self.settings.strategy);
        if !self.settings.resume {
            return Ok(fresh);
        }
        let Some(saved) = self.store.load()? else {
            info!("No resume checkpoint found, starting fresh");
            return Ok(fresh);
        };
        if saved.branch_strategy != self.settings.strategy {
            warn!(
                saved = %saved.branch_strategy,
                current = %self.settings.strategy,
                "Resume checkpoint was written for a different branch strategy; ignoring it"
            );
            return Ok(fresh);
        }

        info!(
            completed = saved.completed_features.len(),
            branch = %saved.current_branch,
            "Resuming from checkpoint"
        );
        let chained = matches!(self.settings.strategy, BranchStrategy::Chained | BranchStrategy::Both);
        if chained
            && !saved.current_branch.is_empty()
            && saved.current_branch != self.branches.base_branch()
        {
            let project = self.branches.project_dir().to_path_buf();
            if self.branches.git().branch_exists(&project, &saved.current_branch).await? {
                self.branches.set_last_successful(Some(saved.current_branch.clone()));
            } else {
                warn!(branch = %saved.current_branch, "Checkpoint branch no longer exists; chaining from base");
            }
        }
        Ok(saved)
    }

    /// Run the loop over `plan`.
    pub async fn run(mut self, plan: &BuildPlan) -> Result<RunReport> {
        let started = Instant::now();
        let project = self.branches.project_dir().to_path_buf();
        self.branches
            .git()
            .ensure_excluded(&project, &[".sdd-state/", "logs/", DRAIN_SENTINEL])
            .await?;

        let mut state = self.initial_state().await?;
        let order: Vec<Feature> = plan
            .order
            .iter()
            .filter(|f| {
                let done = state.is_completed(&f.name);
                if done {
                    info!(id = f.id, name = %f.name, "Already built in a previous run, skipping");
                }
                !done
            })
            .cloned()
            .collect();

        let first_mode = match self.settings.strategy {
            BranchStrategy::Chained | BranchStrategy::Both => IsolationMode::Chained,
            BranchStrategy::Independent => IsolationMode::Independent,
            BranchStrategy::Sequential => IsolationMode::Sequential,
        };

        let first = self
            .run_pass(&order, &plan.order, first_mode, "", Some(&mut state))
            .await?;
        let mut stop = first.stop.clone();
        let mut error = first.error;
        let mut deferred = first.deferred;
        let mut kept = first.kept;
        let mut passes = vec![first.summary];

        let replayable = matches!(
            stop,
            StopReason::Completed | StopReason::NoFeaturesReady | StopReason::MaxFeatures { .. }
        );
        if self.settings.strategy == BranchStrategy::Both && replayable {
            let built: Vec<Feature> = passes[0]
                .features
                .iter()
                .filter(|r| r.status == FeatureOutcome::Built)
                .filter_map(|r| order.iter().find(|f| f.id == r.id).cloned())
                .collect();
            if !built.is_empty() {
                info!(features = built.len(), "Replaying built features independently from base");
                let replay = self
                    .run_pass(&built, &plan.order, IsolationMode::Independent, "-independent", None)
                    .await?;
                if replay.error.is_some() {
                    stop = replay.stop.clone();
                    error = replay.error;
                }
                deferred.extend(replay.deferred);
                kept.extend(replay.kept);
                passes.push(replay.summary);
            }
        }

        let mut drift_batch = None;
        if !deferred.is_empty() && error.is_none() {
            self.observer.step("Running deferred drift checks");
            let batch = run_drift_batch(
                self.agent,
                self.checks,
                self.branches.git(),
                deferred,
                &self.settings.validation,
                self.settings.drift_parallelism,
            )
            .await?;
            if !batch.passed() {
                warn!(failed = ?batch.failed_labels(), "Parallel drift checks reported failures");
            }
            drift_batch = Some(DriftBatchSummary {
                passed: batch.passed(),
                checked: batch.results.len(),
                failed: batch.failed_labels(),
            });
        }
        for ws in &kept {
            if let Err(e) = self.branches.release(ws).await {
                warn!(dir = %ws.dir.display(), "Failed to remove worktree: {:#}", e);
            }
        }

        let finished = matches!(stop, StopReason::Completed | StopReason::NoFeaturesReady);
        let checkpoint_kept = !finished;
        if finished {
            self.store.clear()?;
        }

        let mut summary = BuildSummary::new(
            self.settings.model_label.clone(),
            self.settings.strategy.to_string(),
            started.elapsed().as_secs_f64(),
            stop,
            passes,
        );
        summary.unschedulable = plan
            .unschedulable
            .iter()
            .map(|u| UnschedulableRecord {
                id: u.feature.id,
                name: u.feature.name.clone(),
                reason: u.reason.clone(),
            })
            .collect();
        summary.drift_batch = drift_batch;

        Ok(RunReport {
            summary,
            error,
            checkpoint_kept,
        })
    }

    async fn run_pass(
        &mut self,
        features: &[Feature],
        full_order: &[Feature],
        mode: IsolationMode,
        suffix: &str,
        mut state: Option<&mut ResumeState>,
    ) -> Result<PassResult> {
        let mut result = PassResult {
            summary: PassSummary::new(mode),
            stop: StopReason::Completed,
            error: None,
            deferred: Vec::new(),
            kept: Vec::new(),
        };
        let total = features.len().min(self.settings.max_features);
        self.observer.pass_started(mode, total);

        for (index, feature) in features.iter().enumerate() {
            if self.cancel.is_cancelled() {
                result.stop = StopReason::Interrupted;
                break;
            }
            if index >= self.settings.max_features {
                info!(limit = self.settings.max_features, "Feature limit reached");
                result.stop = StopReason::MaxFeatures {
                    limit: self.settings.max_features,
                };
                break;
            }

            self.observer.feature_started(index, total, feature);
            match self.build_feature(feature, mode, suffix).await {
                Ok(FeatureResult::Built {
                    record,
                    deferred,
                    kept,
                }) => {
                    self.observer.feature_finished(&record);
                    if let Some(state) = state.as_deref_mut() {
                        let next_index = full_order
                            .iter()
                            .position(|f| f.id == feature.id)
                            .map(|p| p + 1)
                            .unwrap_or(index + 1);
                        let head = self
                            .branches
                            .last_successful()
                            .or(record.branch.as_deref())
                            .unwrap_or(self.branches.base_branch())
                            .to_string();
                        state.record(&feature.name, next_index, &head);
                        self.store.save(state)?;
                    }
                    result.deferred.extend(deferred);
                    result.kept.extend(kept);
                    result.summary.push(record);
                }
                Ok(FeatureResult::Failed(record)) => {
                    self.observer.feature_finished(&record);
                    result.summary.push(record);
                }
                Ok(FeatureResult::NoFeaturesReady) => {
                    info!("Agent reports no features ready; stopping");
                    result.stop = StopReason::NoFeaturesReady;
                    break;
                }
                Ok(FeatureResult::Interrupted) => {
                    result.stop = StopReason::Interrupted;
                    break;
                }
                Err(e) => {
                    error!(feature = %feature.name, "Run aborted: {:#}", e);
                    result.stop = StopReason::Fatal {
                        message: format!("{:#}", e),
                    };
                    result.error = Some(e);
                    break;
                }
            }
        }
        Ok(result)
    }

    fn failed_record(
        &self,
        feature: &Feature,
        workspace: &Workspace,
        attempts: u32,
        started: Instant,
        tokens: u64,
        failure: String,
        recovery: Vec<String>,
    ) -> FeatureRecord {
        FeatureRecord {
            id: feature.id,
            name: feature.name.clone(),
            status: FeatureOutcome::Failed,
            attempts,
            duration_secs: started.elapsed().as_secs_f64(),
            branch: workspace.branch.clone(),
            source_files: Vec::new(),
            test_count: None,
            token_estimate: tokens,
            failure: Some(failure),
            recovery,
            notes: Vec::new(),
        }
    }

    async fn build_feature(&mut self, feature: &Feature, mode: IsolationMode, suffix: &str) -> Result<FeatureResult> {
        let started = Instant::now();
        let mut workspace = self.branches.prepare(feature, mode, suffix).await?;
        let label = format!("{}{}", feature.slug(), suffix);
        match self.mark_status(&workspace, feature, FeatureStatus::InProgress).await {
            // Retries reset to the marker commit so the row stays in progress.
            Ok(true) => workspace.start_sha = self.branches.git().head_sha(&workspace.dir).await?,
            Ok(false) => {}
            Err(e) => warn!(feature = %feature.name, "Could not mark roadmap row in progress: {:#}", e),
        }
        let roadmap = self.settings.roadmap.display().to_string();
        let max_attempts = self.settings.max_retries + 1;

        let mut last_failure = String::new();
        let mut tokens: u64 = 0;
        let mut recovery: Vec<String> = Vec::new();
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            if attempt > 1 {
                let tag = format!("{} attempt {}", label, attempt - 1);
                recovery.extend(self.branches.reset(&workspace, &tag).await?);
                if !self.settings.min_retry_delay.is_zero() {
                    info!(delay_secs = self.settings.min_retry_delay.as_secs(), "Waiting before retry");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return self.interrupt(&workspace, feature, &label).await,
                        _ = tokio::time::sleep(self.settings.min_retry_delay) => {}
                    }
                }
            }
            self.observer.attempt_started(feature, attempt, max_attempts);

            let (step, prompt, model) = if attempt == 1 {
                (
                    AgentStep::Build,
                    prompts::build_prompt(feature, &roadmap),
                    self.settings.build_model.clone(),
                )
            } else {
                (
                    AgentStep::Retry,
                    prompts::retry_prompt(feature, &roadmap, attempt, &last_failure),
                    self.settings.retry_model.clone(),
                )
            };
            let request = AgentRequest::new(step, prompt, &workspace.dir)
                .with_model(model)
                .with_label(&label);

            let invoked = tokio::select! {
                _ = self.cancel.cancelled() => return self.interrupt(&workspace, feature, &label).await,
                r = self.agent.invoke(&request) => r,
            };
            let output = match invoked {
                Ok(output) => output,
                Err(e) if matches!(e.downcast_ref::<LoopError>(), Some(LoopError::RateLimitExhausted { .. })) => {
                    warn!(feature = %feature.name, attempt, "{}", e);
                    last_failure = e.to_string();
                    continue;
                }
                Err(e) => {
                    self.restore_pending(&workspace, feature).await;
                    return Err(e);
                }
            };
            tokens += output
                .usage
                .as_ref()
                .map(|u| u.total())
                .unwrap_or_else(|| (estimate_tokens(&request.prompt) + estimate_tokens(&output.raw)) as u64);

            let signal = parse_build_signal(output.searchable());
            info!(feature = %feature.name, attempt, "Agent {}", signal.describe());

            match signal {
                BuildSignal::NoFeaturesReady => {
                    self.branches.reset(&workspace, &format!("{} no features ready", label)).await?;
                    self.restore_pending(&workspace, feature).await;
                    self.branches.release(&workspace).await?;
                    if mode == IsolationMode::Chained {
                        self.branches.return_to_chain_head().await?;
                    }
                    return Ok(FeatureResult::NoFeaturesReady);
                }
                BuildSignal::Built {
                    name,
                    spec_file,
                    source_files,
                } => {
                    self.observer.step("Validating");
                    let claim = BuildClaim {
                        name,
                        spec_file,
                        source_files,
                    };
                    let validator = Validator::new(
                        self.agent,
                        self.checks,
                        self.branches.git(),
                        &self.settings.validation,
                    );
                    let report = validator.validate(&workspace, &claim, &label).await?;
                    if let Some(failure) = report.failure {
                        warn!(feature = %feature.name, attempt, "Validation failed at {}", failure.stage);
                        last_failure = format!(
                            "Validation failed at the {}:\n{}",
                            failure.stage,
                            tail_chars(&failure.output, FAILURE_TAIL_CHARS)
                        );
                        continue;
                    }

                    let mut notes = report.notes;
                    if let Err(e) = self.mark_status(&workspace, feature, FeatureStatus::Completed).await {
                        warn!(feature = %feature.name, "Could not mark roadmap row complete: {:#}", e);
                        notes.push(format!("roadmap not updated: {:#}", e));
                    }
                    self.branches.mark_success(&workspace, mode);

                    let keep = report.deferred_drift.is_some() && workspace.worktree;
                    if !keep {
                        self.branches.release(&workspace).await?;
                    }
                    let record = FeatureRecord {
                        id: feature.id,
                        name: feature.name.clone(),
                        status: FeatureOutcome::Built,
                        attempts,
                        duration_secs: started.elapsed().as_secs_f64(),
                        branch: workspace.branch.clone(),
                        source_files: claim.source_files,
                        test_count: report.test_count,
                        token_estimate: tokens,
                        failure: None,
                        recovery,
                        notes,
                    };
                    return Ok(FeatureResult::Built {
                        record,
                        deferred: report.deferred_drift,
                        kept: keep.then_some(workspace),
                    });
                }
                BuildSignal::Failed { .. } | BuildSignal::Unparseable { .. } => {
                    if output.exit_code != 0 && self.classifier.is_credit_exhausted(&output.raw) {
                        let rec = self
                            .branches
                            .abandon(&workspace, &format!("{} credit exhausted", label))
                            .await?;
                        if !rec.is_empty() {
                            warn!("Partial work kept: {}", rec.join("; "));
                        }
                        self.restore_pending(&workspace, feature).await;
                        return Err(LoopError::CreditExhausted {
                            feature: feature.name.clone(),
                            excerpt: tail_chars(output.raw.trim(), 200).to_string(),
                        }
                        .into());
                    }
                    last_failure = format!(
                        "{}\n\n{}",
                        signal.describe(),
                        tail_chars(output.searchable(), FAILURE_TAIL_CHARS)
                    );
                }
            }
        }

        warn!(feature = %feature.name, attempts, "Feature failed after exhausting retries");
        recovery.extend(
            self.branches
                .abandon(&workspace, &format!("{} failed", label))
                .await?,
        );
        self.restore_pending(&workspace, feature).await;
        self.branches.release(&workspace).await?;
        if mode == IsolationMode::Chained {
            self.branches.return_to_chain_head().await?;
        }
        let summary_line = last_failure.lines().next().unwrap_or("failed").to_string();
        Ok(FeatureResult::Failed(self.failed_record(
            feature,
            &workspace,
            attempts,
            started,
            tokens,
            summary_line,
            recovery,
        )))
    }

    async fn interrupt(&self, workspace: &Workspace, feature: &Feature, label: &str) -> Result<FeatureResult> {
        warn!(label, "Interrupted; stashing work in progress");
        self.branches
            .stash_if_dirty(&workspace.dir, &format!("{} interrupted", label))
            .await?;
        self.restore_pending(workspace, feature).await;
        Ok(FeatureResult::Interrupted)
    }

    /// Rewrite the feature's roadmap row in `workspace` and commit it there.
    /// Returns whether a commit was made.
    async fn mark_status(&self, workspace: &Workspace, feature: &Feature, status: FeatureStatus) -> Result<bool> {
        let path = workspace.dir.join(&self.settings.roadmap);
        if !path.exists() || !set_status(&path, feature.id, status)? {
            return Ok(false);
        }
        let message = format!(
            "{}: mark feature {} ({}) {}",
            BRANCH_PREFIX, feature.id, feature.name, status
        );
        self.branches.git().commit_all(&workspace.dir, &message).await
    }

    /// Put an unfinished feature's row back to pending for the next run.
    async fn restore_pending(&self, workspace: &Workspace, feature: &Feature) {
        if let Err(e) = self.mark_status(workspace, feature, FeatureStatus::Pending).await {
            warn!(feature = %feature.name, "Could not restore roadmap row to pending: {:#}", e);
        }
    }
}
