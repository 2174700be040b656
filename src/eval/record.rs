//! Per-commit eval records.

use super::mechanical::Mechanical;
use crate::signals::parse_signals;
use crate::util::{atomic_write_json, slugify};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Qualitative signals from the eval agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEval {
    #[serde(default)]
    pub framework_compliance: String,
    #[serde(default)]
    pub scope_assessment: String,
    #[serde(default)]
    pub integration_quality: String,
    #[serde(default)]
    pub repeated_mistakes: String,
    #[serde(default)]
    pub eval_notes: String,
}

impl AgentEval {
    /// Parse the agent's signal lines. Nothing is trusted unless the output
    /// carries `EVAL_COMPLETE: true`.
    pub fn parse(output: &str) -> Option<Self> {
        let signals = parse_signals(output);
        if signals.value("EVAL_COMPLETE") != Some("true") {
            return None;
        }
        let get = |name: &str| signals.value(name).unwrap_or_default().to_string();
        Some(Self {
            framework_compliance: get("EVAL_FRAMEWORK_COMPLIANCE"),
            scope_assessment: get("EVAL_SCOPE_ASSESSMENT"),
            integration_quality: get("EVAL_INTEGRATION_QUALITY"),
            repeated_mistakes: get("EVAL_REPEATED_MISTAKES"),
            eval_notes: get("EVAL_NOTES"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub eval_timestamp: DateTime<Utc>,
    pub mechanical: Mechanical,
    #[serde(default)]
    pub agent_eval_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_eval: Option<AgentEval>,
}

impl EvalRecord {
    pub fn new(mechanical: Mechanical, agent_output: Option<&str>) -> Self {
        let agent_eval = agent_output.and_then(AgentEval::parse);
        Self {
            eval_timestamp: Utc::now(),
            mechanical,
            agent_eval_available: agent_eval.is_some(),
            agent_eval,
        }
    }

    /// Feature name the record is filed under; falls back to the short sha.
    pub fn feature_name(&self) -> String {
        match self.mechanical.evaluated() {
            Some(m) if !m.feature_name.is_empty() => m.feature_name.clone(),
            _ => self.mechanical.commit().chars().take(8).collect(),
        }
    }

    /// Write to `<dir>/eval-<feature>.json`, replacing an earlier record for
    /// the same feature.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("eval-{}.json", slugify(&self.feature_name())));
        atomic_write_json(&path, self)?;
        Ok(path)
    }
}
