//! Aggregate summary over every eval record in a directory.

use super::record::EvalRecord;
use crate::util::{atomic_write_json, file_timestamp};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CAMPAIGN_PREFIX: &str = "eval-campaign-";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCounts {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCounts {
    pub focused: usize,
    pub moderate: usize,
    pub sprawling: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationCounts {
    pub clean: usize,
    pub minor_issues: usize,
    pub major_issues: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_timestamp: DateTime<Utc>,
    pub total_features_evaluated: usize,
    pub type_redeclarations_total: usize,
    pub framework_compliance: ComplianceCounts,
    pub scope_assessment: ScopeCounts,
    pub integration_quality: IntegrationCounts,
    pub features_with_issues_count: usize,
    pub features_with_issues: Vec<String>,
}

impl CampaignSummary {
    fn empty() -> Self {
        Self {
            campaign_timestamp: Utc::now(),
            total_features_evaluated: 0,
            type_redeclarations_total: 0,
            framework_compliance: ComplianceCounts::default(),
            scope_assessment: ScopeCounts::default(),
            integration_quality: IntegrationCounts::default(),
            features_with_issues_count: 0,
            features_with_issues: Vec::new(),
        }
    }

    /// Fold one record into the counts.
    fn add(&mut self, record: &EvalRecord) {
        let mut has_issue = false;
        let mechanical = record.mechanical.evaluated();
        let redeclared = mechanical.map(|m| m.type_redeclarations).unwrap_or(0);
        self.type_redeclarations_total += redeclared;
        has_issue |= redeclared > 0;

        if let Some(agent) = record.agent_eval.as_ref().filter(|_| record.agent_eval_available) {
            match agent.framework_compliance.as_str() {
                "pass" => self.framework_compliance.pass += 1,
                "warn" => {
                    self.framework_compliance.warn += 1;
                    has_issue = true;
                }
                "fail" => {
                    self.framework_compliance.fail += 1;
                    has_issue = true;
                }
                _ => {}
            }
            match agent.scope_assessment.as_str() {
                "focused" => self.scope_assessment.focused += 1,
                "moderate" => self.scope_assessment.moderate += 1,
                "sprawling" => {
                    self.scope_assessment.sprawling += 1;
                    has_issue = true;
                }
                _ => {}
            }
            match agent.integration_quality.as_str() {
                "clean" => self.integration_quality.clean += 1,
                "minor_issues" => self.integration_quality.minor_issues += 1,
                "major_issues" => {
                    self.integration_quality.major_issues += 1;
                    has_issue = true;
                }
                _ => {}
            }
        }

        if has_issue {
            let name = mechanical
                .map(|m| m.feature_name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            self.features_with_issues.push(name);
            self.features_with_issues_count = self.features_with_issues.len();
        }
    }
}

/// Eval record files in `dir`, sorted, excluding earlier campaign summaries.
pub fn eval_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("eval-*.json");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid eval file pattern {}", pattern))?
        .filter_map(|entry| entry.ok())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| !n.to_string_lossy().starts_with(CAMPAIGN_PREFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Summarise the records in `dir`. `None` when there are none.
pub fn summarize(dir: &Path) -> Result<Option<CampaignSummary>> {
    let files = eval_files(dir)?;
    if files.is_empty() {
        return Ok(None);
    }

    let mut summary = CampaignSummary::empty();
    summary.total_features_evaluated = files.len();
    for file in &files {
        let parsed = std::fs::read_to_string(file)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str::<EvalRecord>(&s).map_err(anyhow::Error::from));
        match parsed {
            Ok(record) => summary.add(&record),
            Err(e) => warn!(file = %file.display(), "Could not parse eval file: {}", e),
        }
    }
    Ok(Some(summary))
}

/// Write `eval-campaign-<timestamp>.json` into `dir`.
pub fn write_campaign(dir: &Path) -> Result<Option<PathBuf>> {
    let Some(summary) = summarize(dir)? else {
        info!(dir = %dir.display(), "No eval results to summarize");
        return Ok(None);
    };
    let path = dir.join(format!("{}{}.json", CAMPAIGN_PREFIX, file_timestamp()));
    atomic_write_json(&path, &summary)?;
    info!(
        path = %path.display(),
        evaluated = summary.total_features_evaluated,
        with_issues = summary.features_with_issues_count,
        "Campaign summary written"
    );
    Ok(Some(path))
}
