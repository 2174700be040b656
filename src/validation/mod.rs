//! Validation of agent build claims.
//!
//! - `checks`: build and test commands (configured, skipped or detected)
//! - `frontmatter`: feature spec header checks
//! - `pipeline`: the ordered validation steps and the parallel drift batch

mod checks;
mod frontmatter;
mod pipeline;

pub use checks::{
    CheckKind, CheckOutcome, CheckRunner, ShellChecks, detect_build_command,
    detect_test_command, parse_test_count,
};
pub use frontmatter::{
    FrontmatterIssue, REQUIRED_FIELDS, SpecError, SpecFrontmatter, parse_frontmatter,
    validate_frontmatter,
};
pub use pipeline::{
    BuildClaim, DriftBatchReport, DriftPair, DriftPairResult, Stage, ValidationFailure,
    ValidationReport, ValidationSettings, Validator, default_parallelism, run_drift_batch,
    verify,
};
