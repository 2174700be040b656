//! Runtime configuration for auto-sdd.
//!
//! Built once at startup and passed by reference. Each value resolves in
//! this order, first hit wins: CLI flag, environment variable (after loading
//! `<project>/.env.local`), `auto-sdd.toml`, built-in default.

use crate::agent::{AgentStep, BackoffPolicy};
use crate::settings::{BranchStrategy, CheckCommand, SettingsFile};
use anyhow::{Context, Result};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const STATE_DIR: &str = ".sdd-state";
pub const LOG_DIR: &str = "logs";
pub const ROADMAP_FILE: &str = ".specs/roadmap.md";
pub const ENV_FILE: &str = ".env.local";
pub const CODE_REVIEW_STEP: &str = "code-review";

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub branch_strategy: Option<BranchStrategy>,
    pub max_features: Option<usize>,
    pub resume: bool,
    pub eval_sidecar: bool,
    pub eval_interval_secs: Option<u64>,
    pub eval_agent: Option<bool>,
    pub eval_output_dir: Option<PathBuf>,
    pub verbose: bool,
}

/// Per-step model selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOverrides {
    pub default: Option<String>,
    pub build: Option<String>,
    pub retry: Option<String>,
    pub drift: Option<String>,
    pub review: Option<String>,
    pub eval: Option<String>,
}

impl ModelOverrides {
    /// Model for `step`, falling back to the default model.
    pub fn for_step(&self, step: AgentStep) -> Option<String> {
        let specific = match step {
            AgentStep::Build => &self.build,
            AgentStep::Retry => &self.retry,
            AgentStep::Drift => &self.drift,
            AgentStep::Review => &self.review,
            AgentStep::Eval => &self.eval,
        };
        specific.clone().or_else(|| self.default.clone())
    }
}

/// Eval sidecar settings.
#[derive(Debug, Clone)]
pub struct EvalSettings {
    /// Launch the sidecar alongside `build`.
    pub sidecar: bool,
    pub interval: Duration,
    /// Run the agent pass in addition to the mechanical pass.
    pub agent: bool,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub roadmap_file: PathBuf,
    pub lock_dir: PathBuf,
    pub claude_cmd: String,
    pub max_features: usize,
    pub max_retries: u32,
    pub min_retry_delay: Duration,
    pub branch_strategy: BranchStrategy,
    /// `None` means "whatever is checked out at startup".
    pub base_branch: Option<String>,
    pub build_check: CheckCommand,
    pub test_check: CheckCommand,
    pub drift_check: bool,
    pub max_drift_retries: u32,
    pub post_build_steps: Vec<String>,
    pub models: ModelOverrides,
    pub parallel_validation: bool,
    pub max_context_tokens: usize,
    pub worktree_min_free_gb: u64,
    pub resume: bool,
    pub backoff: BackoffPolicy,
    pub eval: EvalSettings,
    pub verbose: bool,
}

/// Typed reader over an environment lookup function.
struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, expected: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                anyhow::anyhow!("Invalid value for {}: '{}' ({}; expected {})", key, raw, e, expected)
            }),
        }
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => parse_bool(&raw)
                .map(Some)
                .with_context(|| format!("Invalid value for {}: '{}' (expected true or false)", key, raw)),
        }
    }
}

/// Parse the boolean spellings accepted in the environment.
pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}

fn split_steps(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from `.env.local`, the process environment and
    /// `auto-sdd.toml`, with `cli` on top.
    pub fn load(project_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        let env_file = project_dir.join(ENV_FILE);
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }
        Self::resolve(project_dir, cli, &|key| std::env::var(key).ok())
    }

    /// Resolve configuration with an explicit environment lookup.
    pub fn resolve(
        project_dir: &Path,
        cli: &CliOverrides,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let file = SettingsFile::load_or_default(&project_dir)?;
        let env = EnvReader { lookup: env };

        let branch_strategy = match cli.branch_strategy {
            Some(s) => s,
            None => env
                .parse::<BranchStrategy>("BRANCH_STRATEGY", "chained, independent, sequential or both")?
                .or(file.build.branch_strategy)
                .unwrap_or_default(),
        };

        let max_features = match cli.max_features {
            Some(n) => n,
            None => env
                .parse("MAX_FEATURES", "a non-negative integer")?
                .or(file.build.max_features)
                .unwrap_or(25),
        };

        let max_retries = env
            .parse("MAX_RETRIES", "a non-negative integer")?
            .or(file.build.max_retries)
            .unwrap_or(1);

        let min_retry_delay = Duration::from_secs(
            env.parse("MIN_RETRY_DELAY", "seconds")?
                .or(file.build.min_retry_delay_secs)
                .unwrap_or(30),
        );

        let base_branch = env.string("BASE_BRANCH").or(file.build.base_branch);

        let build_check = env
            .string("BUILD_CHECK_CMD")
            .or(file.validation.build_check)
            .map(|s| s.parse::<CheckCommand>().unwrap_or_default())
            .unwrap_or_default();
        let test_check = env
            .string("TEST_CHECK_CMD")
            .or(file.validation.test_check)
            .map(|s| s.parse::<CheckCommand>().unwrap_or_default())
            .unwrap_or_default();

        let drift_check = env
            .bool("DRIFT_CHECK")?
            .or(file.validation.drift_check)
            .unwrap_or(true);
        let max_drift_retries = env
            .parse("MAX_DRIFT_RETRIES", "a non-negative integer")?
            .or(file.validation.max_drift_retries)
            .unwrap_or(1);

        let post_build_steps = match env.string("POST_BUILD_STEPS") {
            Some(raw) => split_steps(&raw),
            None => file
                .validation
                .post_build_steps
                .unwrap_or_else(|| vec![CODE_REVIEW_STEP.to_string()]),
        };

        let models = ModelOverrides {
            default: env.string("AGENT_MODEL").or(file.models.default),
            build: env.string("BUILD_MODEL").or(file.models.build),
            retry: env.string("RETRY_MODEL").or(file.models.retry),
            drift: env.string("DRIFT_MODEL").or(file.models.drift),
            review: env.string("REVIEW_MODEL").or(file.models.review),
            eval: env.string("EVAL_MODEL").or(file.models.eval),
        };

        let parallel_validation = env
            .bool("PARALLEL_VALIDATION")?
            .or(file.validation.parallel)
            .unwrap_or(false);
        let max_context_tokens = env
            .parse("MAX_CONTEXT_TOKENS", "a token count")?
            .or(file.validation.max_context_tokens)
            .unwrap_or(crate::context::DEFAULT_MAX_CONTEXT_TOKENS);
        let worktree_min_free_gb = env
            .parse("WORKTREE_MIN_FREE_GB", "gigabytes")?
            .or(file.worktree.min_free_gb)
            .unwrap_or(5);

        let resume = cli.resume
            || env
                .bool("ENABLE_RESUME")?
                .or(file.build.resume)
                .unwrap_or(false);

        let defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            max_retries: env
                .parse("AGENT_MAX_BACKOFF_RETRIES", "a non-negative integer")?
                .or(file.agent.backoff_max_retries)
                .unwrap_or(defaults.max_retries),
            cap: env
                .parse::<u64>("AGENT_BACKOFF_CAP", "seconds")?
                .or(file.agent.backoff_cap_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cap),
        };

        let claude_cmd = env
            .string("CLAUDE_CMD")
            .or(file.agent.claude_cmd)
            .unwrap_or_else(|| "claude".to_string());

        let lock_dir = env
            .string("LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let log_dir = project_dir.join(LOG_DIR);
        let eval_output = cli
            .eval_output_dir
            .clone()
            .or_else(|| env.string("EVAL_OUTPUT_DIR").map(PathBuf::from))
            .or(file.eval.output_dir)
            .unwrap_or_else(|| PathBuf::from(LOG_DIR).join("evals"));
        let eval = EvalSettings {
            sidecar: cli.eval_sidecar
                || env.bool("EVAL_SIDECAR")?.or(file.eval.sidecar).unwrap_or(false),
            interval: Duration::from_secs(
                cli.eval_interval_secs
                    .or(env.parse("EVAL_INTERVAL", "seconds")?)
                    .or(file.eval.interval_secs)
                    .unwrap_or(30)
                    .max(1),
            ),
            agent: match cli.eval_agent {
                Some(v) => v,
                None => env.bool("EVAL_AGENT")?.or(file.eval.agent).unwrap_or(true),
            },
            output_dir: if eval_output.is_absolute() {
                eval_output
            } else {
                project_dir.join(eval_output)
            },
        };

        Ok(Self {
            state_dir: project_dir.join(STATE_DIR),
            roadmap_file: project_dir.join(ROADMAP_FILE),
            log_dir,
            project_dir,
            lock_dir,
            claude_cmd,
            max_features,
            max_retries,
            min_retry_delay,
            branch_strategy,
            base_branch,
            build_check,
            test_check,
            drift_check,
            max_drift_retries,
            post_build_steps,
            models,
            parallel_validation,
            max_context_tokens,
            worktree_min_free_gb,
            resume,
            backoff,
            eval,
            verbose: cli.verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(self.agent_log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.eval.output_dir)
            .context("Failed to create eval output directory")?;
        Ok(())
    }

    pub fn agent_log_dir(&self) -> PathBuf {
        self.log_dir.join("agent")
    }

    pub fn cost_log(&self) -> PathBuf {
        self.log_dir.join("cost-log.jsonl")
    }

    pub fn resume_file(&self) -> PathBuf {
        self.state_dir.join("resume.json")
    }

    /// Parent directory for independent-strategy worktrees, beside the project.
    pub fn worktree_root(&self) -> PathBuf {
        let name = self
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        self.project_dir
            .parent()
            .unwrap_or(&self.project_dir)
            .join(".auto-sdd-worktrees")
            .join(name)
    }

    pub fn code_review_enabled(&self) -> bool {
        self.post_build_steps.iter().any(|s| s == CODE_REVIEW_STEP)
    }

    pub fn model_for(&self, step: AgentStep) -> Option<String> {
        self.models.for_step(step)
    }

    /// Human-readable configuration summary. Every optional step is listed
    /// whether it is enabled or not.
    pub fn summary_lines(&self) -> Vec<String> {
        fn check_label(cmd: &CheckCommand) -> String {
            match cmd {
                CheckCommand::Auto => "auto-detect".to_string(),
                CheckCommand::Skip => "SKIPPED".to_string(),
                CheckCommand::Custom(c) => format!("`{}`", c),
            }
        }

        let mut lines = vec![
            format!("Project:          {}", self.project_dir.display()),
            format!(
                "Branch strategy:  {} (base: {})",
                self.branch_strategy,
                self.base_branch.as_deref().unwrap_or("current branch")
            ),
            format!("Max features:     {}", self.max_features),
            format!(
                "Max retries:      {} (min delay {}s)",
                self.max_retries,
                self.min_retry_delay.as_secs()
            ),
            format!("Build check:      {}", check_label(&self.build_check)),
            format!("Test check:       {}", check_label(&self.test_check)),
        ];

        lines.push(if self.drift_check {
            format!(
                "Drift check:      enabled (max {} retries{})",
                self.max_drift_retries,
                if self.parallel_validation { ", parallel batch" } else { "" }
            )
        } else {
            "Drift check:      DISABLED".to_string()
        });
        lines.push(format!(
            "Code review:      {}",
            if self.code_review_enabled() { "enabled" } else { "DISABLED" }
        ));
        lines.push(format!("Context budget:   {} tokens", self.max_context_tokens));
        if matches!(self.branch_strategy, BranchStrategy::Independent | BranchStrategy::Both) {
            lines.push(format!("Worktree floor:   {} GB free", self.worktree_min_free_gb));
        }
        lines.push(format!("Resume:           {}", if self.resume { "on" } else { "off" }));
        lines.push(format!(
            "Eval sidecar:     {}",
            if self.eval.sidecar { "on" } else { "off" }
        ));
        lines.push(format!(
            "Model:            {}",
            self.models.default.as_deref().unwrap_or("agent default")
        ));
        lines
    }

    /// Warnings about risky but legal settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.branch_strategy == BranchStrategy::Sequential {
            warnings.push(
                "Sequential strategy builds directly on the current checkout; failed work is only stashed"
                    .to_string(),
            );
        }
        if !self.drift_check && self.parallel_validation {
            warnings.push("PARALLEL_VALIDATION has no effect while DRIFT_CHECK is off".to_string());
        }
        if self.build_check == CheckCommand::Skip && self.test_check == CheckCommand::Skip {
            warnings.push("Both build and test checks are skipped; success claims are barely verified".to_string());
        }
        if self.max_features == 0 {
            warnings.push("MAX_FEATURES is 0; nothing will be built".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let dir = tempdir().unwrap();
        let cfg = Config::resolve(dir.path(), &CliOverrides::default(), &env_from(&[])).unwrap();
        assert_eq!(cfg.max_features, 25);
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.min_retry_delay, Duration::from_secs(30));
        assert_eq!(cfg.branch_strategy, BranchStrategy::Chained);
        assert_eq!(cfg.build_check, CheckCommand::Auto);
        assert!(cfg.drift_check);
        assert!(cfg.code_review_enabled());
        assert!(!cfg.parallel_validation);
        assert_eq!(cfg.max_context_tokens, 100_000);
        assert_eq!(cfg.worktree_min_free_gb, 5);
        assert_eq!(cfg.backoff, BackoffPolicy::default());
        assert!(cfg.state_dir.ends_with(".sdd-state"));
        assert!(cfg.eval.output_dir.ends_with("logs/evals"));
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("auto-sdd.toml"),
            "[build]\nmax_retries = 4\nbranch_strategy = \"independent\"\nmax_features = 3\n",
        )
        .unwrap();
        let env = env_from(&[("MAX_RETRIES", "2"), ("BRANCH_STRATEGY", "both")]);
        let cli = CliOverrides {
            branch_strategy: Some(BranchStrategy::Sequential),
            ..Default::default()
        };
        let cfg = Config::resolve(dir.path(), &cli, &env).unwrap();
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.max_features, 3);
        assert_eq!(cfg.branch_strategy, BranchStrategy::Sequential);
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let dir = tempdir().unwrap();
        let err = Config::resolve(
            dir.path(),
            &CliOverrides::default(),
            &env_from(&[("BRANCH_STRATEGY", "zigzag")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("BRANCH_STRATEGY"));

        let err = Config::resolve(
            dir.path(),
            &CliOverrides::default(),
            &env_from(&[("MAX_RETRIES", "lots")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("MAX_RETRIES"));

        let err = Config::resolve(
            dir.path(),
            &CliOverrides::default(),
            &env_from(&[("DRIFT_CHECK", "maybe")]),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("DRIFT_CHECK"));
    }

    #[test]
    fn test_check_commands_and_steps_from_env() {
        let dir = tempdir().unwrap();
        let env = env_from(&[
            ("BUILD_CHECK_CMD", "skip"),
            ("TEST_CHECK_CMD", "make test"),
            ("POST_BUILD_STEPS", ""),
            ("DRIFT_CHECK", "false"),
        ]);
        let cfg = Config::resolve(dir.path(), &CliOverrides::default(), &env).unwrap();
        assert_eq!(cfg.build_check, CheckCommand::Skip);
        assert_eq!(cfg.test_check, CheckCommand::Custom("make test".into()));
        assert!(!cfg.drift_check);
        // Blank POST_BUILD_STEPS falls through to the default.
        assert!(cfg.code_review_enabled());

        let env = env_from(&[("POST_BUILD_STEPS", "lint")]);
        let cfg = Config::resolve(dir.path(), &CliOverrides::default(), &env).unwrap();
        assert!(!cfg.code_review_enabled());
    }

    #[test]
    fn test_model_fallback() {
        let dir = tempdir().unwrap();
        let env = env_from(&[("AGENT_MODEL", "sonnet"), ("DRIFT_MODEL", "haiku")]);
        let cfg = Config::resolve(dir.path(), &CliOverrides::default(), &env).unwrap();
        assert_eq!(cfg.model_for(AgentStep::Drift).as_deref(), Some("haiku"));
        assert_eq!(cfg.model_for(AgentStep::Build).as_deref(), Some("sonnet"));
    }

    #[test]
    fn test_summary_shows_disabled_steps() {
        let dir = tempdir().unwrap();
        let env = env_from(&[
            ("DRIFT_CHECK", "0"),
            ("TEST_CHECK_CMD", "skip"),
            ("POST_BUILD_STEPS", "none"),
        ]);
        let cfg = Config::resolve(dir.path(), &CliOverrides::default(), &env).unwrap();
        let summary = cfg.summary_lines().join("\n");
        assert!(summary.contains("Drift check:      DISABLED"));
        assert!(summary.contains("Test check:       SKIPPED"));
        assert!(summary.contains("Code review:      DISABLED"));
    }

    #[test]
    fn test_validate_warns_on_sequential() {
        let dir = tempdir().unwrap();
        let cli = CliOverrides {
            branch_strategy: Some(BranchStrategy::Sequential),
            ..Default::default()
        };
        let cfg = Config::resolve(dir.path(), &cli, &env_from(&[])).unwrap();
        assert!(cfg.validate().iter().any(|w| w.contains("Sequential")));
    }

    #[test]
    fn test_worktree_root_is_beside_project() {
        let dir = tempdir().unwrap();
        let cfg = Config::resolve(dir.path(), &CliOverrides::default(), &env_from(&[])).unwrap();
        let root = cfg.worktree_root();
        assert_eq!(root.parent().unwrap().parent().unwrap(), cfg.project_dir.parent().unwrap());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("YES").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("perhaps").is_err());
    }
}
