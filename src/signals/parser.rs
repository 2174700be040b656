//! Signal parsing from agent output.
//!
//! A signal is a line of the form `NAME: value` (or a bare `NAME` flag line)
//! anywhere in the output. Names are upper-case identifiers. The value keeps
//! internal whitespace and colons; only its outer whitespace is trimmed.

use super::types::{BuildSignal, DriftSignal, ReviewSignal, SignalLine, SignalSet};
use regex::Regex;
use std::sync::LazyLock;

static SIGNAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*([A-Z][A-Z0-9_]*[A-Z0-9])(?::(.*))?$").unwrap());

pub const FEATURE_BUILT: &str = "FEATURE_BUILT";
pub const SPEC_FILE: &str = "SPEC_FILE";
pub const SOURCE_FILES: &str = "SOURCE_FILES";
pub const BUILD_FAILED: &str = "BUILD_FAILED";
pub const NO_FEATURES_READY: &str = "NO_FEATURES_READY";
pub const NO_DRIFT: &str = "NO_DRIFT";
pub const DRIFT_FIXED: &str = "DRIFT_FIXED";
pub const DRIFT_UNRESOLVABLE: &str = "DRIFT_UNRESOLVABLE";
pub const REVIEW_CLEAN: &str = "REVIEW_CLEAN";
pub const REVIEW_FIXED: &str = "REVIEW_FIXED";
pub const REVIEW_FAILED: &str = "REVIEW_FAILED";

/// Collect every signal line in `text`.
pub fn parse_signals(text: &str) -> SignalSet {
    let mut set = SignalSet::new();
    for (idx, raw) in text.lines().enumerate() {
        let raw = raw.trim_end_matches('\r');
        let Some(cap) = SIGNAL_REGEX.captures(raw) else {
            continue;
        };
        let name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = cap.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        set.push(SignalLine {
            name: name.to_string(),
            value: value.to_string(),
            line: idx,
        });
    }
    set
}

/// Split a comma-separated file list, dropping blanks.
pub fn split_file_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Interpret the output of a build or retry invocation.
///
/// `NO_FEATURES_READY` takes precedence. Otherwise a complete success
/// (`FEATURE_BUILT` plus `SPEC_FILE`) and `BUILD_FAILED` compete, and the
/// one whose line appears later wins.
pub fn parse_build_signal(text: &str) -> BuildSignal {
    let set = parse_signals(text);

    if set.has(NO_FEATURES_READY) {
        return BuildSignal::NoFeaturesReady;
    }

    let built = set.last(FEATURE_BUILT);
    let failed = set.last(BUILD_FAILED);

    let failed_is_later = match (built, failed) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(b), Some(f)) => f.line > b.line,
    };

    if failed_is_later {
        let reason = failed.map(|f| f.value.clone()).unwrap_or_default();
        let reason = if reason.is_empty() {
            "unspecified".to_string()
        } else {
            reason
        };
        return BuildSignal::Failed { reason };
    }

    let Some(built) = built else {
        return BuildSignal::Unparseable {
            reason: "no FEATURE_BUILT or BUILD_FAILED signal".to_string(),
        };
    };

    if built.value.is_empty() {
        return BuildSignal::Unparseable {
            reason: "FEATURE_BUILT is empty".to_string(),
        };
    }

    let Some(spec_file) = set.non_empty(SPEC_FILE) else {
        return BuildSignal::Unparseable {
            reason: format!("FEATURE_BUILT '{}' without SPEC_FILE", built.value),
        };
    };

    BuildSignal::Built {
        name: built.value.clone(),
        spec_file: spec_file.to_string(),
        source_files: set.value(SOURCE_FILES).map(split_file_list).unwrap_or_default(),
    }
}

/// Interpret the output of a drift-check invocation.
pub fn parse_drift_signal(text: &str) -> DriftSignal {
    let set = parse_signals(text);
    match set.latest_of(&[NO_DRIFT, DRIFT_FIXED, DRIFT_UNRESOLVABLE]) {
        Some(l) if l.name == NO_DRIFT => DriftSignal::NoDrift,
        Some(l) if l.name == DRIFT_FIXED => DriftSignal::Fixed {
            summary: l.value.clone(),
        },
        Some(l) => DriftSignal::Unresolvable {
            reason: l.value.clone(),
        },
        None => DriftSignal::Missing,
    }
}

/// Interpret the output of a code-review invocation.
pub fn parse_review_signal(text: &str) -> ReviewSignal {
    let set = parse_signals(text);
    match set.latest_of(&[REVIEW_CLEAN, REVIEW_FIXED, REVIEW_FAILED]) {
        Some(l) if l.name == REVIEW_CLEAN => ReviewSignal::Clean,
        Some(l) if l.name == REVIEW_FIXED => ReviewSignal::Fixed {
            summary: l.value.clone(),
        },
        Some(l) => ReviewSignal::Failed {
            reason: l.value.clone(),
        },
        None => ReviewSignal::Missing,
    }
}
