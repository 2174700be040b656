//! Prompt templates for every agent step.
//!
//! Each template ends with the exact signal lines the agent must print; the
//! orchestrator decides outcomes from those lines alone.

use crate::context::tail_chars;
use crate::roadmap::Feature;

/// How much of the previous failure output a retry prompt carries.
pub const RETRY_CONTEXT_CHARS: usize = 4000;

const BUILD_SIGNALS: &str = "\
When you are done, print these lines exactly, each on its own line:

FEATURE_BUILT: <feature name>
SPEC_FILE: <path to the feature spec, relative to the repository root>
SOURCE_FILES: <comma-separated list of source files you created or changed>

If you cannot complete the feature, print instead:

BUILD_FAILED: <one-line reason>

If every remaining roadmap feature is blocked or already done, print:

NO_FEATURES_READY
";

fn feature_header(feature: &Feature) -> String {
    let deps = if feature.deps.is_empty() {
        "none".to_string()
    } else {
        feature
            .deps
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "- **Feature**: #{} {}\n- **Complexity**: {}\n- **Depends on**: {}\n",
        feature.id, feature.name, feature.complexity, deps
    )
}

/// First-attempt prompt: build the feature from scratch.
pub fn build_prompt(feature: &Feature, roadmap: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Build the next roadmap feature\n\n");
    prompt.push_str(&feature_header(feature));
    prompt.push_str(&format!("- **Roadmap**: `{}`\n\n", roadmap));
    prompt.push_str(
        "## Instructions\n\n\
         1. Read the roadmap and the feature spec under `.specs/`. Write the spec first if it does not exist, with `feature` and `domain` in its frontmatter.\n\
         2. Write tests for the spec scenarios, then implement until they pass.\n\
         3. Make sure the project builds and the full test suite passes.\n\
         4. Commit all of your work. Leave no uncommitted changes.\n\
         5. Do not edit the status column of the roadmap; the orchestrator does that.\n\n",
    );
    prompt.push_str("## Output\n\n");
    prompt.push_str(BUILD_SIGNALS);
    prompt
}

/// Prompt for attempt 2 and later. Assumes broken state and asks for repair.
pub fn retry_prompt(feature: &Feature, roadmap: &str, attempt: u32, failure: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Repair a failed build (attempt {})\n\n",
        attempt
    ));
    prompt.push_str(&feature_header(feature));
    prompt.push_str(&format!("- **Roadmap**: `{}`\n\n", roadmap));
    prompt.push_str(
        "The previous attempt at this feature failed and the workspace was reset to the commit it started from. \
         Do not start over blindly: read the failure below, work out what went wrong, and fix that.\n\n",
    );
    prompt.push_str("## Previous failure\n\n```\n");
    prompt.push_str(tail_chars(failure.trim(), RETRY_CONTEXT_CHARS));
    prompt.push_str("\n```\n\n");
    prompt.push_str(
        "## Instructions\n\n\
         1. Fix the cause of the failure. Keep the spec and implementation in agreement.\n\
         2. Make sure the project builds and the full test suite passes.\n\
         3. Commit all of your work. Leave no uncommitted changes.\n\n",
    );
    prompt.push_str("## Output\n\n");
    prompt.push_str(BUILD_SIGNALS);
    prompt
}

/// Drift check for one spec and its sources.
///
/// `commit` is false for batched checks, where the orchestrator commits after
/// re-verifying the workspace.
pub fn drift_prompt(spec_file: &str, spec_content: &str, source_files: &[String], commit: bool) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Spec drift check\n\n");
    prompt.push_str(
        "Compare the specification below with the source files that implement it and decide whether they still agree.\n\n",
    );
    prompt.push_str(&format!("## Spec: `{}`\n\n", spec_file));
    prompt.push_str(spec_content);
    prompt.push_str("\n\n## Source files\n\n");
    if source_files.is_empty() {
        prompt.push_str("(none listed; find the implementation from the spec)\n");
    }
    for file in source_files {
        prompt.push_str(&format!("- `{}`\n", file));
    }
    prompt.push_str(
        "\n## Rules\n\n\
         - If they disagree, update the SPEC to describe what the code does. Never change the code to match the spec.\n\
         - Do not touch any file other than the spec.\n",
    );
    if commit {
        prompt.push_str("- Commit the spec change if you made one.\n");
    } else {
        prompt.push_str("- Do NOT commit. Leave your spec edits in the working tree.\n");
    }
    prompt.push_str(
        "\n## Output\n\nPrint exactly one of:\n\n\
         NO_DRIFT\n\
         DRIFT_FIXED: <what you changed in the spec>\n\
         DRIFT_UNRESOLVABLE: <why the spec cannot be reconciled>\n",
    );
    prompt
}

/// Post-build code review pass.
pub fn review_prompt(feature_name: &str, source_files: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Code review: {}\n\n", feature_name));
    prompt.push_str("Review the files changed for this feature:\n\n");
    for file in source_files {
        prompt.push_str(&format!("- `{}`\n", file));
    }
    prompt.push_str(
        "\n## Checklist\n\n\
         - Security: injection, secrets in code, unchecked input at trust boundaries\n\
         - Correctness: unhandled errors, race conditions, off-by-one mistakes\n\
         - Types: unsafe casts, `any`, missing null handling\n\
         - Resources: leaked handles, unbounded growth\n\n\
         ## Rules\n\n\
         - Fix CRITICAL issues only. Report everything else in your notes.\n\
         - Do not change behaviour, public interfaces, or tests' expectations.\n\
         - Make sure the project still builds and its tests pass, then commit your fixes.\n\n\
         ## Output\n\nPrint exactly one of:\n\n\
         REVIEW_CLEAN\n\
         REVIEW_FIXED: <summary of the critical fixes>\n\
         REVIEW_FAILED: <why the review could not be completed>\n",
    );
    prompt
}

/// Read-only quality assessment of a single commit.
pub fn eval_prompt(commit: &str, diff: &str, claude_md: &str, learnings: &str) -> String {
    format!(
        "You are an eval agent reviewing commit {commit}.\n\n\
         IMPORTANT: do NOT modify any files, do NOT commit, do NOT ask for user input. You are read-only.\n\n\
         ## Your Task\n\n\
         Review the diff below and assess this commit against the project's standards.\n\n\
         ## Project Standards (CLAUDE.md)\n\n{claude_md}\n\n\
         ## Recent Learnings\n\n{learnings}\n\n\
         ## Diff to Review\n\n{diff}\n\n\
         ## Assessment Criteria\n\n\
         1. **Framework Compliance**: are specs, tests and implementation consistent?\n\
         2. **Scope Discipline**: is the commit focused on one feature, or does it sprawl?\n\
         3. **Integration Quality**: are imports clean, types used properly, existing patterns followed?\n\
         4. **Repeated Mistakes**: does it repeat a mistake recorded in the learnings?\n\n\
         ## Required Output Signals\n\n\
         EVAL_COMPLETE: true\n\
         EVAL_FRAMEWORK_COMPLIANCE: <pass|warn|fail>\n\
         EVAL_SCOPE_ASSESSMENT: <focused|moderate|sprawling>\n\
         EVAL_INTEGRATION_QUALITY: <clean|minor_issues|major_issues>\n\
         EVAL_REPEATED_MISTAKES: <none|comma-separated list>\n\
         EVAL_NOTES: <one-line summary>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roadmap::FeatureStatus;

    fn feature() -> Feature {
        Feature {
            id: 7,
            name: "Search".into(),
            source: String::new(),
            issue: String::new(),
            complexity: "M".into(),
            deps: vec![2, 3],
            status: FeatureStatus::Pending,
        }
    }

    #[test]
    fn test_build_prompt_lists_signals() {
        let p = build_prompt(&feature(), ".specs/roadmap.md");
        assert!(p.contains("#7 Search"));
        assert!(p.contains("2, 3"));
        for signal in ["FEATURE_BUILT:", "SPEC_FILE:", "SOURCE_FILES:", "BUILD_FAILED:", "NO_FEATURES_READY"] {
            assert!(p.contains(signal), "missing {}", signal);
        }
    }

    #[test]
    fn test_retry_prompt_keeps_tail_of_failure() {
        let failure = format!("{}TAIL-MARKER", "x".repeat(10_000));
        let p = retry_prompt(&feature(), ".specs/roadmap.md", 2, &failure);
        assert!(p.contains("attempt 2"));
        assert!(p.contains("TAIL-MARKER"));
        assert!(!p.contains(&"x".repeat(RETRY_CONTEXT_CHARS)));
        assert_ne!(p, build_prompt(&feature(), ".specs/roadmap.md"));
    }

    #[test]
    fn test_drift_prompt_commit_modes() {
        let files = vec!["src/search.ts".to_string()];
        assert!(drift_prompt("s.md", "spec", &files, true).contains("Commit the spec"));
        assert!(drift_prompt("s.md", "spec", &files, false).contains("Do NOT commit"));
    }

    #[test]
    fn test_eval_prompt_signals() {
        let p = eval_prompt("abc123", "+x", "", "");
        assert!(p.contains("abc123"));
        assert!(p.contains("EVAL_COMPLETE: true"));
    }
}
