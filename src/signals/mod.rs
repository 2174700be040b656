//! Signal protocol between the orchestrator and the agent.
//!
//! The agent reports outcomes as plain lines inside its free-form output:
//!
//! - `FEATURE_BUILT: <name>` / `SPEC_FILE: <path>` / `SOURCE_FILES: a, b`
//! - `BUILD_FAILED: <reason>`
//! - `NO_FEATURES_READY`
//! - `NO_DRIFT`, `DRIFT_FIXED: ...`, `DRIFT_UNRESOLVABLE: ...`
//! - `REVIEW_CLEAN`, `REVIEW_FIXED: ...`, `REVIEW_FAILED: ...`
//!
//! These lines are the only basis for deciding what an invocation achieved;
//! the agent's exit code is never trusted for success.

mod parser;
mod types;

pub use parser::{
    BUILD_FAILED, FEATURE_BUILT, NO_FEATURES_READY, SOURCE_FILES, SPEC_FILE, parse_build_signal,
    parse_drift_signal, parse_review_signal, parse_signals, split_file_list,
};
pub use types::{BuildSignal, DriftSignal, ReviewSignal, SignalLine, SignalSet};
