//! Signal types exchanged between the orchestrator and the agent.
//!
//! The agent reports outcomes as `NAME: value` lines embedded in otherwise
//! free-form output. `SignalSet` holds every such line in output order; the
//! typed enums below are the closed set of outcomes the loop switches on.

use serde::{Deserialize, Serialize};

/// One `NAME: value` line found in agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalLine {
    pub name: String,
    /// Value with only outer whitespace trimmed.
    pub value: String,
    /// Zero-based line number in the output.
    pub line: usize,
}

/// Every signal line of one agent output, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalSet {
    lines: Vec<SignalLine>,
}

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: SignalLine) {
        self.lines.push(line);
    }

    /// Last occurrence of `name`. Repeated signals resolve to the last one.
    pub fn last(&self, name: &str) -> Option<&SignalLine> {
        self.lines.iter().rev().find(|l| l.name == name)
    }

    /// Value of the last occurrence of `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.last(name).map(|l| l.value.as_str())
    }

    /// Value of the last occurrence of `name`, ignoring empty values.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.value(name).filter(|v| !v.is_empty())
    }

    pub fn has(&self, name: &str) -> bool {
        self.last(name).is_some()
    }

    /// Whichever of `names` appears latest in the output.
    pub fn latest_of(&self, names: &[&str]) -> Option<&SignalLine> {
        self.lines
            .iter()
            .rev()
            .find(|l| names.contains(&l.name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignalLine> {
        self.lines.iter()
    }
}

/// Outcome of a build (or retry) invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSignal {
    /// Agent claims success and named the spec it implemented.
    Built {
        name: String,
        spec_file: String,
        source_files: Vec<String>,
    },
    /// Agent explicitly gave up.
    Failed { reason: String },
    /// Every remaining feature is blocked or done.
    NoFeaturesReady,
    /// Neither a complete success nor an explicit failure.
    Unparseable { reason: String },
}

impl BuildSignal {
    pub fn is_built(&self) -> bool {
        matches!(self, BuildSignal::Built { .. })
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            BuildSignal::Built { name, .. } => format!("built '{}'", name),
            BuildSignal::Failed { reason } => format!("failed: {}", reason),
            BuildSignal::NoFeaturesReady => "no features ready".to_string(),
            BuildSignal::Unparseable { reason } => format!("no clear signal ({})", reason),
        }
    }
}

/// Outcome of a drift-check invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftSignal {
    NoDrift,
    Fixed { summary: String },
    Unresolvable { reason: String },
    Missing,
}

/// Outcome of a code-review invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewSignal {
    Clean,
    Fixed { summary: String },
    Failed { reason: String },
    Missing,
}
