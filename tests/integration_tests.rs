//! Integration tests for the auto-sdd CLI
//!
//! These exercise the binary end to end on throwaway project directories.
//! Nothing here needs an agent CLI or network access.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const HEADER: &str = "| # | Feature | Source | Jira | Complexity | Deps | Status |\n|---|---|---|---|---|---|---|\n";

/// Helper to create an auto-sdd Command with a clean configuration environment
fn sdd() -> Command {
    let mut cmd = cargo_bin_cmd!("auto-sdd");
    for key in [
        "CLAUDE_CMD",
        "LOCK_DIR",
        "BRANCH_STRATEGY",
        "MAX_FEATURES",
        "BASE_BRANCH",
        "EVAL_SIDECAR",
        "RUST_LOG",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn project_with_roadmap(rows: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".specs")).unwrap();
    fs::write(
        dir.path().join(".specs/roadmap.md"),
        format!("# Roadmap\n\n{}{}", HEADER, rows),
    )
    .unwrap();
    dir
}

fn write_spec(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        sdd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("build"))
            .stdout(predicate::str::contains("validate-spec"));
    }

    #[test]
    fn test_version() {
        sdd().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let dir = project_with_roadmap("");
        sdd()
            .current_dir(dir.path())
            .args(["build", "--strategy", "sideways"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Build order
// =============================================================================

mod order {
    use super::*;

    #[test]
    fn test_order_respects_dependencies() {
        let dir = project_with_roadmap(
            "| 1 | Auth | spec | - | S | - | \u{2b1c} |\n\
             | 2 | Feed | spec | - | M | 3 | \u{2b1c} |\n\
             | 3 | Profile | spec | - | S | 1 | \u{2b1c} |\n",
        );
        let output = sdd()
            .current_dir(dir.path())
            .arg("order")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let stdout = String::from_utf8(output).unwrap();
        let auth = stdout.find("#1 Auth").unwrap();
        let profile = stdout.find("#3 Profile").unwrap();
        let feed = stdout.find("#2 Feed").unwrap();
        assert!(auth < profile && profile < feed, "{}", stdout);
    }

    #[test]
    fn test_completed_features_are_not_listed() {
        let dir = project_with_roadmap(
            "| 1 | Auth | spec | - | S | - | \u{2705} |\n\
             | 2 | Profile | spec | - | S | 1 | \u{2b1c} |\n",
        );
        sdd()
            .current_dir(dir.path())
            .arg("order")
            .assert()
            .success()
            .stdout(predicate::str::contains("#2 Profile"))
            .stdout(predicate::str::contains("#1 Auth").not());
    }

    #[test]
    fn test_cycle_exits_with_code_three() {
        let dir = project_with_roadmap(
            "| 1 | Auth | spec | - | S | 2 | \u{2b1c} |\n\
             | 2 | Profile | spec | - | S | 1 | \u{2b1c} |\n",
        );
        sdd()
            .current_dir(dir.path())
            .arg("order")
            .assert()
            .code(3)
            .stderr(predicate::str::contains("Circular dependency"));
    }

    #[test]
    fn test_missing_roadmap_is_empty() {
        let dir = TempDir::new().unwrap();
        sdd()
            .current_dir(dir.path())
            .arg("order")
            .assert()
            .success()
            .stdout(predicate::str::contains("No pending features"));
    }
}

// =============================================================================
// Build preflight
// =============================================================================

mod build_preflight {
    use super::*;

    #[test]
    fn test_held_lock_exits_with_code_four() {
        let dir = project_with_roadmap("| 1 | Auth | spec | - | S | - | \u{2b1c} |\n");
        let locks = TempDir::new().unwrap();
        let lock = auto_sdd::lock::lock_path_for(dir.path(), locks.path());
        fs::write(&lock, std::process::id().to_string()).unwrap();

        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", locks.path())
            .arg("build")
            .assert()
            .code(4)
            .stderr(predicate::str::contains("already running"));

        assert!(lock.exists(), "a live lock must not be removed");
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = project_with_roadmap("| 1 | Auth | spec | - | S | - | \u{2b1c} |\n");
        let locks = TempDir::new().unwrap();
        let lock = auto_sdd::lock::lock_path_for(dir.path(), locks.path());
        // PID 0 is never a live owner.
        fs::write(&lock, "0").unwrap();

        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", locks.path())
            .env("CLAUDE_CMD", "auto-sdd-missing-agent-cli")
            .arg("build")
            .assert()
            .code(1);

        assert!(!lock.exists(), "the lock is released on exit");
    }

    #[test]
    fn test_missing_agent_cli_is_fatal() {
        let dir = project_with_roadmap("| 1 | Auth | spec | - | S | - | \u{2b1c} |\n");
        let locks = TempDir::new().unwrap();

        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", locks.path())
            .env("CLAUDE_CMD", "auto-sdd-missing-agent-cli")
            .arg("build")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Branch strategy"))
            .stderr(predicate::str::contains("auto-sdd-missing-agent-cli"));
    }

    #[test]
    fn test_file_log_is_flushed_on_fatal_exit() {
        let dir = project_with_roadmap("| 1 | Auth | spec | - | S | - | \u{2b1c} |\n");
        let locks = TempDir::new().unwrap();

        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", locks.path())
            .env("CLAUDE_CMD", "auto-sdd-missing-agent-cli")
            .args(["--verbose", "build"])
            .assert()
            .code(1);

        let log = fs::read_to_string(dir.path().join("logs/auto-sdd.log")).unwrap();
        assert!(log.contains("Holding project lock"), "{}", log);
    }

    #[test]
    fn test_config_file_strategy_is_reported() {
        let dir = project_with_roadmap("");
        fs::write(
            dir.path().join(".env.local"),
            "BRANCH_STRATEGY=independent\nCLAUDE_CMD=auto-sdd-missing-agent-cli\n",
        )
        .unwrap();
        let locks = TempDir::new().unwrap();

        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", locks.path())
            .arg("build")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("independent"));
    }
}

// =============================================================================
// Spec validation
// =============================================================================

mod validate_spec {
    use super::*;

    #[test]
    fn test_valid_spec_passes() {
        let dir = TempDir::new().unwrap();
        write_spec(
            dir.path(),
            ".specs/features/auth/login.feature.md",
            "---\nfeature: Login\ndomain: auth\nstatus: draft\n---\n\n# Login\n",
        );
        sdd()
            .current_dir(dir.path())
            .args(["validate-spec", ".specs/features/auth/login.feature.md"])
            .assert()
            .success()
            .stdout(predicate::str::contains("auth / Login"));
    }

    #[test]
    fn test_invalid_spec_fails_with_reason() {
        let dir = TempDir::new().unwrap();
        write_spec(dir.path(), "good.md", "---\nfeature: A\ndomain: b\n---\n");
        write_spec(dir.path(), "bad.md", "---\nfeature: Login\n---\nbody\n");
        sdd()
            .current_dir(dir.path())
            .args(["validate-spec", "good.md", "bad.md"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("domain"))
            .stderr(predicate::str::contains("1 of 2"));
    }

    #[test]
    fn test_requires_at_least_one_file() {
        sdd().arg("validate-spec").assert().failure();
    }
}

// =============================================================================
// Status and eval campaign
// =============================================================================

mod status {
    use super::*;
    use auto_sdd::orchestrator::{FileStateStore, ResumeState, StateStore};
    use auto_sdd::settings::BranchStrategy;

    #[test]
    fn test_status_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", locks.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Checkpoint: none"))
            .stdout(predicate::str::contains("Lock:       free"));
    }

    #[test]
    fn test_status_shows_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut state = ResumeState::new(BranchStrategy::Chained);
        state.record("Auth", 1, "auto/chained-feature-1-auth");
        FileStateStore::new(dir.path().join(".sdd-state/resume.json"))
            .save(&state)
            .unwrap();

        sdd()
            .current_dir(dir.path())
            .env("LOCK_DIR", dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("chained strategy, 1 feature(s) completed"))
            .stdout(predicate::str::contains("auto/chained-feature-1-auth"));
    }
}

mod campaign {
    use super::*;

    #[test]
    fn test_campaign_without_records() {
        let dir = TempDir::new().unwrap();
        sdd()
            .current_dir(dir.path())
            .arg("campaign")
            .assert()
            .success()
            .stdout(predicate::str::contains("No eval records"));
    }

    #[test]
    fn test_campaign_counts_unreadable_records() {
        let dir = TempDir::new().unwrap();
        let evals = dir.path().join("logs/evals");
        fs::create_dir_all(&evals).unwrap();
        fs::write(evals.join("eval-broken.json"), "not json").unwrap();

        sdd()
            .current_dir(dir.path())
            .arg("campaign")
            .assert()
            .success()
            .stdout(predicate::str::contains("Campaign summary written"));

        let written: Vec<_> = fs::read_dir(&evals)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("eval-campaign-"))
            .collect();
        assert_eq!(written.len(), 1);
        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(written[0].path()).unwrap()).unwrap();
        assert_eq!(summary["total_features_evaluated"], 1);
    }
}
