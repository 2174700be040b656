//! `auto-sdd build`: the feature build loop.

use anyhow::Result;
use std::ffi::OsString;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn cmd_build(
    project_dir: &Path,
    overrides: auto_sdd::config::CliOverrides,
    cancel: CancellationToken,
) -> Result<()> {
    use auto_sdd::agent::{AgentStep, BackoffAgent, ClaudeAgent};
    use auto_sdd::config::{Config, ROADMAP_FILE};
    use auto_sdd::errors::LoopError;
    use auto_sdd::eval::{DEFAULT_DRAIN_TIMEOUT, SidecarHandle};
    use auto_sdd::lock::ProjectLock;
    use auto_sdd::orchestrator::{BuildLoop, DriverSettings, FileStateStore};
    use auto_sdd::roadmap::{Roadmap, resolve};
    use auto_sdd::ui::BuildUI;
    use auto_sdd::ui::icons::{LOCK, WARN};
    use auto_sdd::util::find_executable;
    use auto_sdd::validation::{ShellChecks, ValidationSettings, default_parallelism};
    use auto_sdd::workspace::{BranchManager, Git, GitCli};
    use console::style;

    let config = Config::load(project_dir, &overrides)?;
    let lock = ProjectLock::acquire(&config.project_dir, &config.lock_dir)?;
    tracing::debug!(lock = %lock.path().display(), "Holding project lock");

    println!("{}", style("auto-sdd build").bold().cyan());
    for line in config.summary_lines() {
        println!("  {}", line);
    }
    for warning in config.validate() {
        println!("  {}{}", WARN, style(warning).yellow());
    }
    println!();

    if find_executable(&config.claude_cmd).is_none() {
        return Err(LoopError::MissingTool {
            tool: config.claude_cmd.clone(),
        }
        .into());
    }
    config.ensure_directories()?;

    let roadmap = Roadmap::load(&config.roadmap_file)?;
    let plan = resolve(roadmap.features())?;
    if plan.is_empty() {
        println!("Nothing to build: no pending features are ready");
        for u in &plan.unschedulable {
            println!("  #{} {}: {}", u.feature.id, u.feature.name, style(&u.reason).dim());
        }
        return Ok(());
    }

    let git = GitCli::new();
    let base_branch = match &config.base_branch {
        Some(branch) => branch.clone(),
        None => git.current_branch(&config.project_dir).await?,
    };
    let agent = BackoffAgent::new(
        ClaudeAgent::new(&config.claude_cmd, config.agent_log_dir()).with_cost_log(config.cost_log()),
        config.backoff,
    );
    let checks = ShellChecks::new(config.build_check.clone(), config.test_check.clone());
    let store = FileStateStore::new(config.resume_file());
    let branches = BranchManager::new(
        git,
        &config.project_dir,
        &base_branch,
        config.worktree_root(),
        config.worktree_min_free_gb,
    );

    let roadmap_rel = config
        .roadmap_file
        .strip_prefix(&config.project_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| ROADMAP_FILE.into());
    let settings = DriverSettings {
        strategy: config.branch_strategy,
        max_features: config.max_features,
        max_retries: config.max_retries,
        min_retry_delay: config.min_retry_delay,
        resume: config.resume,
        roadmap: roadmap_rel,
        build_model: config.model_for(AgentStep::Build),
        retry_model: config.model_for(AgentStep::Retry),
        model_label: config
            .models
            .default
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        validation: ValidationSettings {
            drift_check: config.drift_check,
            max_drift_retries: config.max_drift_retries,
            code_review: config.code_review_enabled(),
            defer_drift: config.parallel_validation,
            max_context_tokens: config.max_context_tokens,
            drift_model: config.model_for(AgentStep::Drift),
            review_model: config.model_for(AgentStep::Review),
        },
        drift_parallelism: default_parallelism(),
    };

    let mut sidecar = if config.eval.sidecar {
        let extra: Vec<OsString> = vec![
            "--output-dir".into(),
            config.eval.output_dir.clone().into_os_string(),
        ];
        let log_file = config.log_dir.join("eval-sidecar.log");
        match SidecarHandle::spawn_self(&config.project_dir, Some(&log_file), &extra) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Eval sidecar not started: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let ui = BuildUI::new(config.verbose);
    let report = BuildLoop::new(&agent, &checks, branches, &store, settings)
        .with_observer(&ui)
        .with_cancellation(cancel)
        .run(&plan)
        .await?;

    ui.print_summary(&report.summary);
    match report.summary.write(&config.log_dir) {
        Ok(path) => println!("  Summary written to {}", style(path.display()).dim()),
        Err(e) => tracing::warn!("Could not write build summary: {:#}", e),
    }
    if report.checkpoint_kept {
        println!("  {}Checkpoint kept at {}", LOCK, style(config.resume_file().display()).dim());
    }

    if let Some(mut handle) = sidecar.take() {
        if handle.is_running() {
            println!("  Waiting for the eval sidecar to finish...");
        }
        match handle.drain(DEFAULT_DRAIN_TIMEOUT).await {
            Ok(Some(status)) if !status.success() => {
                tracing::warn!(%status, "Eval sidecar exited with an error")
            }
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!("Eval sidecar was killed after the drain timeout"),
            Err(e) => tracing::warn!("Eval sidecar drain failed: {:#}", e),
        }
    }

    match report.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
