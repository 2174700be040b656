//! Machine-readable record of a build run.

use crate::util::{atomic_write_json, file_timestamp};
use crate::workspace::IsolationMode;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureOutcome {
    Built,
    Failed,
}

/// One feature in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub id: u32,
    pub name: String,
    pub status: FeatureOutcome,
    pub attempts: u32,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub source_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_count: Option<u32>,
    pub token_estimate: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Stashes and rescue branches holding partial work.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Accounting for one pass over the build order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    pub mode: IsolationMode,
    pub built: usize,
    pub failed: usize,
    pub features: Vec<FeatureRecord>,
}

impl PassSummary {
    pub fn new(mode: IsolationMode) -> Self {
        Self {
            mode,
            built: 0,
            failed: 0,
            features: Vec::new(),
        }
    }

    pub fn push(&mut self, record: FeatureRecord) {
        match record.status {
            FeatureOutcome::Built => self.built += 1,
            FeatureOutcome::Failed => self.failed += 1,
        }
        self.features.push(record);
    }

    pub fn built_names(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| f.status == FeatureOutcome::Built)
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| f.status == FeatureOutcome::Failed)
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    NoFeaturesReady,
    MaxFeatures { limit: usize },
    Interrupted,
    Fatal { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnschedulableRecord {
    pub id: u32,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftBatchSummary {
    pub passed: bool,
    pub checked: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub timestamp: DateTime<Utc>,
    pub total_time_secs: f64,
    pub model: String,
    pub branch_strategy: String,
    pub built: usize,
    pub failed: usize,
    pub total_tests: u32,
    pub stop_reason: StopReason,
    pub passes: Vec<PassSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unschedulable: Vec<UnschedulableRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_batch: Option<DriftBatchSummary>,
}

impl BuildSummary {
    /// Totals are taken from the first pass; replay passes are reported
    /// separately under `passes`.
    pub fn new(
        model: impl Into<String>,
        branch_strategy: impl Into<String>,
        total_time_secs: f64,
        stop_reason: StopReason,
        passes: Vec<PassSummary>,
    ) -> Self {
        let (built, failed, total_tests) = passes
            .first()
            .map(|p| {
                let tests = p.features.iter().filter_map(|f| f.test_count).sum();
                (p.built, p.failed, tests)
            })
            .unwrap_or((0, 0, 0));
        Self {
            timestamp: Utc::now(),
            total_time_secs,
            model: model.into(),
            branch_strategy: branch_strategy.into(),
            built,
            failed,
            total_tests,
            stop_reason,
            passes,
            unschedulable: Vec::new(),
            drift_batch: None,
        }
    }

    /// Write to `<log_dir>/build-summary-<timestamp>.json`.
    pub fn write(&self, log_dir: &Path) -> Result<PathBuf> {
        let path = log_dir.join(format!("build-summary-{}.json", file_timestamp()));
        atomic_write_json(&path, self)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str, status: FeatureOutcome, tests: Option<u32>) -> FeatureRecord {
        FeatureRecord {
            id: 1,
            name: name.into(),
            status,
            attempts: 1,
            duration_secs: 1.5,
            branch: None,
            source_files: vec![],
            test_count: tests,
            token_estimate: 100,
            failure: None,
            recovery: vec![],
            notes: vec![],
        }
    }

    #[test]
    fn test_totals_come_from_first_pass() {
        let mut chained = PassSummary::new(IsolationMode::Chained);
        chained.push(record("A", FeatureOutcome::Built, Some(10)));
        chained.push(record("B", FeatureOutcome::Failed, None));
        chained.push(record("C", FeatureOutcome::Built, Some(5)));
        let mut replay = PassSummary::new(IsolationMode::Independent);
        replay.push(record("A", FeatureOutcome::Failed, None));

        let summary = BuildSummary::new("sonnet", "both", 12.0, StopReason::Completed, vec![chained, replay]);
        assert_eq!(summary.built, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_tests, 15);
        assert_eq!(summary.passes[1].failed_names(), vec!["A"]);
    }

    #[test]
    fn test_write_summary_json() {
        let dir = tempdir().unwrap();
        let mut pass = PassSummary::new(IsolationMode::Chained);
        pass.push(record("A", FeatureOutcome::Built, Some(3)));
        let summary = BuildSummary::new("unknown", "chained", 1.0, StopReason::NoFeaturesReady, vec![pass]);
        let path = summary.write(dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("build-summary-"));

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["stop_reason"]["kind"], "no_features_ready");
        assert_eq!(raw["passes"][0]["mode"], "chained");
        assert_eq!(raw["passes"][0]["features"][0]["status"], "built");
        assert_eq!(raw["total_tests"], 3);
    }
}
