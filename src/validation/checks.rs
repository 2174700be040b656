//! Build and test checks.
//!
//! Each check is a shell command run with `sh -c` in the workspace. The
//! command is either configured explicitly, disabled with `skip`, or detected
//! from the project files present in the workspace.

use crate::settings::CheckCommand;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info};

static CARGO_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").unwrap()
});
static JEST_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Tests:\s+.*?(\d+) total").unwrap());
static VITEST_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Tests\s+.*\((\d+)\)\s*$").unwrap());
static PYTEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^=+ (.*\b(?:passed|failed)\b.*) in [\d.]+s.*=+\s*$").unwrap());
static PYTEST_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:passed|failed|errors?)").unwrap());
static GO_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*--- (?:PASS|FAIL): ").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Build,
    Test,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Build => write!(f, "build"),
            CheckKind::Test => write!(f, "test"),
        }
    }
}

/// Result of one check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    /// No command was configured or detected.
    pub skipped: bool,
    pub command: Option<String>,
    pub output: String,
    pub test_count: Option<u32>,
}

impl CheckOutcome {
    pub fn skipped() -> Self {
        Self {
            passed: true,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_test_count(mut self, count: u32) -> Self {
        self.test_count = Some(count);
        self
    }
}

/// Runs build and test checks in a directory.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, kind: CheckKind, dir: &Path) -> Result<CheckOutcome>;
}

#[async_trait]
impl<C: CheckRunner + ?Sized> CheckRunner for std::sync::Arc<C> {
    async fn run(&self, kind: CheckKind, dir: &Path) -> Result<CheckOutcome> {
        (**self).run(kind, dir).await
    }
}

/// Guess the build command for the project in `dir`.
pub fn detect_build_command(dir: &Path) -> Option<String> {
    if dir.join("Cargo.toml").exists() {
        Some("cargo check".into())
    } else if dir.join("tsconfig.json").exists() {
        Some("npx tsc --noEmit".into())
    } else if dir.join("go.mod").exists() {
        Some("go build ./...".into())
    } else if dir.join("pyproject.toml").exists() || dir.join("setup.py").exists() {
        Some("python -m compileall -q .".into())
    } else {
        None
    }
}

/// Guess the test command for the project in `dir`.
pub fn detect_test_command(dir: &Path) -> Option<String> {
    if dir.join("Cargo.toml").exists() {
        return Some("cargo test".into());
    }
    let package_json = dir.join("package.json");
    if package_json.exists() {
        let has_test_script = std::fs::read_to_string(&package_json)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .is_some_and(|v| v.pointer("/scripts/test").is_some_and(|t| t.is_string()));
        if has_test_script {
            return Some("npm test".into());
        }
    }
    if dir.join("go.mod").exists() {
        Some("go test ./...".into())
    } else if dir.join("pyproject.toml").exists() || dir.join("setup.py").exists() {
        Some("pytest".into())
    } else {
        None
    }
}

/// Extract the number of tests run from common runner summaries.
pub fn parse_test_count(output: &str) -> Option<u32> {
    let mut cargo_total = None;
    for caps in CARGO_RESULT.captures_iter(output) {
        let passed: u32 = caps[1].parse().unwrap_or(0);
        let failed: u32 = caps[2].parse().unwrap_or(0);
        *cargo_total.get_or_insert(0) += passed + failed;
    }
    if cargo_total.is_some() {
        return cargo_total;
    }

    if let Some(caps) = JEST_TOTAL.captures(output) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = VITEST_TOTAL.captures(output) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = PYTEST_SUMMARY.captures(output) {
        let total: u32 = PYTEST_PART
            .captures_iter(&caps[1])
            .filter_map(|c| c[1].parse::<u32>().ok())
            .sum();
        return Some(total);
    }

    let go_cases = GO_CASE.find_iter(output).count();
    if go_cases > 0 {
        return u32::try_from(go_cases).ok();
    }
    None
}

/// [`CheckRunner`] that runs configured or detected shell commands.
#[derive(Debug, Clone)]
pub struct ShellChecks {
    build: CheckCommand,
    test: CheckCommand,
}

impl ShellChecks {
    pub fn new(build: CheckCommand, test: CheckCommand) -> Self {
        Self { build, test }
    }

    /// The command that would run for `kind` in `dir`, if any.
    pub fn command_for(&self, kind: CheckKind, dir: &Path) -> Option<String> {
        let configured = match kind {
            CheckKind::Build => &self.build,
            CheckKind::Test => &self.test,
        };
        match configured {
            CheckCommand::Skip => None,
            CheckCommand::Custom(cmd) => Some(cmd.clone()),
            CheckCommand::Auto => match kind {
                CheckKind::Build => detect_build_command(dir),
                CheckKind::Test => detect_test_command(dir),
            },
        }
    }
}

#[async_trait]
impl CheckRunner for ShellChecks {
    async fn run(&self, kind: CheckKind, dir: &Path) -> Result<CheckOutcome> {
        let Some(command) = self.command_for(kind, dir) else {
            debug!(dir = %dir.display(), "No {} command, skipping", kind);
            return Ok(CheckOutcome::skipped());
        };

        info!(dir = %dir.display(), "Running {} check: {}", kind, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {} check: {}", kind, command))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let test_count = match kind {
            CheckKind::Test => parse_test_count(&combined),
            CheckKind::Build => None,
        };

        Ok(CheckOutcome {
            passed: output.status.success(),
            skipped: false,
            command: Some(command),
            output: combined,
            test_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_detect_rust_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_build_command(dir.path()).as_deref(), Some("cargo check"));
        assert_eq!(detect_test_command(dir.path()).as_deref(), Some("cargo test"));
    }

    #[test]
    fn test_detect_node_project() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "vitest run"}}"#,
        )
        .unwrap();
        assert_eq!(detect_build_command(dir.path()).as_deref(), Some("npx tsc --noEmit"));
        assert_eq!(detect_test_command(dir.path()).as_deref(), Some("npm test"));
    }

    #[test]
    fn test_package_json_without_test_script() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"scripts": {}}"#).unwrap();
        assert_eq!(detect_test_command(dir.path()), None);
        assert_eq!(detect_build_command(dir.path()), None);
    }

    #[test]
    fn test_parse_cargo_counts_sum_all_binaries() {
        let out = "test result: ok. 12 passed; 0 failed; 0 ignored\n\
                   test result: FAILED. 3 passed; 1 failed; 0 ignored\n";
        assert_eq!(parse_test_count(out), Some(16));
    }

    #[test]
    fn test_parse_jest_and_vitest() {
        assert_eq!(
            parse_test_count("Tests:       1 failed, 12 passed, 13 total\n"),
            Some(13)
        );
        assert_eq!(parse_test_count("      Tests  40 passed (40)\n"), Some(40));
    }

    #[test]
    fn test_parse_pytest_and_go() {
        assert_eq!(
            parse_test_count("======= 7 passed, 2 failed in 0.31s =======\n"),
            Some(9)
        );
        assert_eq!(
            parse_test_count("=== RUN   TestA\n--- PASS: TestA (0.00s)\n--- FAIL: TestB (0.00s)\n"),
            Some(2)
        );
        assert_eq!(parse_test_count("nothing here"), None);
    }

    #[tokio::test]
    async fn test_shell_check_pass_fail_and_skip() {
        let dir = tempdir().unwrap();
        let checks = ShellChecks::new(
            CheckCommand::Custom("echo building; exit 0".into()),
            CheckCommand::Custom("echo 'test result: ok. 2 passed; 1 failed'; echo oops >&2; exit 1".into()),
        );
        let build = checks.run(CheckKind::Build, dir.path()).await.unwrap();
        assert!(build.passed);
        assert!(build.output.contains("building"));

        let test = checks.run(CheckKind::Test, dir.path()).await.unwrap();
        assert!(!test.passed);
        assert!(test.output.contains("oops"));
        assert_eq!(test.test_count, Some(3));

        let skipping = ShellChecks::new(CheckCommand::Skip, CheckCommand::Auto);
        let outcome = skipping.run(CheckKind::Build, dir.path()).await.unwrap();
        assert!(outcome.skipped && outcome.passed);
        // Nothing to detect in an empty dir.
        assert!(skipping.run(CheckKind::Test, dir.path()).await.unwrap().skipped);
    }
}
