//! Project settings file (`auto-sdd.toml`) and the enumerated setting types.
//!
//! Every field is optional; anything left out falls through to the
//! environment and then to built-in defaults (see [`crate::config`]).
//!
//! # Configuration File Format
//!
//! ```toml
//! [build]
//! max_features = 25
//! max_retries = 1
//! min_retry_delay_secs = 30
//! branch_strategy = "chained"
//! base_branch = "main"
//! resume = false
//!
//! [validation]
//! build_check = "auto"          # auto | skip | <command>
//! test_check = "npm test"
//! drift_check = true
//! max_drift_retries = 1
//! post_build_steps = ["code-review"]
//! parallel = false
//! max_context_tokens = 100000
//!
//! [models]
//! default = "sonnet"
//! drift = "haiku"
//!
//! [agent]
//! claude_cmd = "claude"
//! backoff_max_retries = 5
//! backoff_cap_secs = 60
//!
//! [worktree]
//! min_free_gb = 5
//!
//! [eval]
//! sidecar = false
//! interval_secs = 30
//! agent = true
//! output_dir = "logs/evals"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "auto-sdd.toml";

/// Branch isolation strategy for feature builds.
///
/// | Strategy      | Workspace for feature K                              |
/// |---------------|------------------------------------------------------|
/// | `Chained`     | new branch off the last successful feature's branch  |
/// | `Independent` | fresh worktree off the base branch                   |
/// | `Sequential`  | the current checkout, no branching                   |
/// | `Both`        | a chained pass, then an independent replay           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStrategy {
    #[default]
    Chained,
    Independent,
    Sequential,
    Both,
}

impl std::fmt::Display for BranchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchStrategy::Chained => write!(f, "chained"),
            BranchStrategy::Independent => write!(f, "independent"),
            BranchStrategy::Sequential => write!(f, "sequential"),
            BranchStrategy::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for BranchStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chained" => Ok(BranchStrategy::Chained),
            "independent" => Ok(BranchStrategy::Independent),
            "sequential" => Ok(BranchStrategy::Sequential),
            "both" => Ok(BranchStrategy::Both),
            _ => anyhow::bail!(
                "Invalid branch strategy '{}'. Valid values: chained, independent, sequential, both",
                s
            ),
        }
    }
}

/// How a build or test check command is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CheckCommand {
    /// Detect from the project's manifest files.
    #[default]
    Auto,
    /// Step disabled.
    Skip,
    /// Explicit shell command.
    Custom(String),
}

impl std::fmt::Display for CheckCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckCommand::Auto => write!(f, "auto"),
            CheckCommand::Skip => write!(f, "skip"),
            CheckCommand::Custom(cmd) => write!(f, "{}", cmd),
        }
    }
}

impl std::str::FromStr for CheckCommand {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(match trimmed.to_lowercase().as_str() {
            "" | "auto" => CheckCommand::Auto,
            "skip" => CheckCommand::Skip,
            _ => CheckCommand::Custom(trimmed.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSection {
    pub max_features: Option<usize>,
    pub max_retries: Option<u32>,
    pub min_retry_delay_secs: Option<u64>,
    pub branch_strategy: Option<BranchStrategy>,
    pub base_branch: Option<String>,
    pub resume: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSection {
    pub build_check: Option<String>,
    pub test_check: Option<String>,
    pub drift_check: Option<bool>,
    pub max_drift_retries: Option<u32>,
    pub post_build_steps: Option<Vec<String>>,
    pub parallel: Option<bool>,
    pub max_context_tokens: Option<usize>,
}

/// Per-step model overrides; `default` applies to any step without its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsSection {
    pub default: Option<String>,
    pub build: Option<String>,
    pub retry: Option<String>,
    pub drift: Option<String>,
    pub review: Option<String>,
    pub eval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    pub claude_cmd: Option<String>,
    pub backoff_max_retries: Option<u32>,
    pub backoff_cap_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeSection {
    pub min_free_gb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSection {
    pub sidecar: Option<bool>,
    pub interval_secs: Option<u64>,
    pub agent: Option<bool>,
    pub output_dir: Option<PathBuf>,
}

/// Root of `auto-sdd.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub eval: EvalSection,
}

impl SettingsFile {
    /// Load `auto-sdd.toml` from `project_dir`, or defaults when absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid auto-sdd.toml")
    }
}
