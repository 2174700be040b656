//! Typed error hierarchy for auto-sdd.
//!
//! Two top-level enums cover the two process domains:
//! - `LoopError`: run-level failures of the build loop, each mapped to a
//!   process exit code
//! - `EvalError`: failures inside the eval sidecar, which never reach the
//!   build loop

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for generic fatal conditions (missing tool, quota exhaustion).
pub const EXIT_FATAL: i32 = 1;
/// Exit code when the roadmap contains a dependency cycle.
pub const EXIT_CYCLE: i32 = 3;
/// Exit code when another instance holds the project lock.
pub const EXIT_LOCKED: i32 = 4;
/// Exit code when a worktree cannot be created for lack of disk space.
pub const EXIT_DISK: i32 = 5;

/// Errors that abort (or locally fail) a build-loop run.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Another auto-sdd instance is already running (PID {pid}, lock file {lock_file})")]
    LockHeld { pid: u32, lock_file: PathBuf },

    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error(
        "Insufficient disk space at {path}: {required_gb} GB required, {available_gb:.1} GB available"
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        required_gb: u64,
        available_gb: f64,
    },

    #[error("Agent credit or quota exhausted while building '{feature}': {excerpt}")]
    CreditExhausted { feature: String, excerpt: String },

    #[error("Required tool '{tool}' was not found")]
    MissingTool { tool: String },

    #[error("Agent still rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopError::CircularDependency { .. } => EXIT_CYCLE,
            LoopError::LockHeld { .. } => EXIT_LOCKED,
            LoopError::InsufficientDiskSpace { .. } => EXIT_DISK,
            _ => EXIT_FATAL,
        }
    }

    /// Whether the error makes every remaining feature futile.
    pub fn is_run_fatal(&self) -> bool {
        !matches!(self, LoopError::RateLimitExhausted { .. } | LoopError::Git { .. })
    }
}

/// Errors from the eval sidecar.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Commit {sha} not found")]
    CommitNotFound { sha: String },

    #[error("Repository has no HEAD commit")]
    NoHead,

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Extract the exit code for an arbitrary `anyhow` error chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LoopError>())
        .map(LoopError::exit_code)
        .unwrap_or(EXIT_FATAL)
}
