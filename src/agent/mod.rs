//! Agent invocation.
//!
//! The agent is an opaque CLI that takes a prompt and a working directory and
//! produces free-form text. Everything the loop needs from it goes through
//! the [`Agent`] trait so the driver can be exercised against scripted fakes.
//!
//! | Type              | Role                                                 |
//! |-------------------|------------------------------------------------------|
//! | `ClaudeAgent`     | spawns the Claude CLI with JSON output               |
//! | `BackoffAgent`    | retries rate-limited invocations with backoff        |
//! | `KeywordClassifier` | recognises rate-limit and quota text in output     |

mod backoff;
mod claude;
mod classifier;

pub use backoff::{BackoffAgent, BackoffPolicy};
pub use claude::{ClaudeAgent, ClaudeJson, ModelUsage, dominant_model};
pub use classifier::{KeywordClassifier, OutputClassifier};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which pipeline step an invocation serves. Selects the model override and
/// names the log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStep {
    Build,
    Retry,
    Drift,
    Review,
    Eval,
}

impl std::fmt::Display for AgentStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStep::Build => "build",
            AgentStep::Retry => "retry",
            AgentStep::Drift => "drift",
            AgentStep::Review => "review",
            AgentStep::Eval => "eval",
        };
        f.write_str(s)
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub step: AgentStep,
    pub model: Option<String>,
    /// Short tag (usually the feature slug) used in log file names.
    pub label: String,
}

impl AgentRequest {
    pub fn new(step: AgentStep, prompt: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            workdir: workdir.into(),
            step,
            model: None,
            label: step.to_string(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Token usage reported by the agent CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// What came back from one invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// The agent's answer (the JSON `result` when available).
    pub text: String,
    /// Combined stdout and stderr as captured.
    pub raw: String,
    pub exit_code: i32,
    pub usage: Option<Usage>,
}

impl AgentOutput {
    /// Text to scan for signals and error keywords.
    pub fn searchable(&self) -> &str {
        if self.text.is_empty() { &self.raw } else { &self.text }
    }
}

/// An AI coding agent.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput>;
}

#[async_trait]
impl<A: Agent + ?Sized> Agent for std::sync::Arc<A> {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        (**self).invoke(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = AgentRequest::new(AgentStep::Drift, "check", "/tmp/ws")
            .with_model(Some("haiku".into()))
            .with_label("auth");
        assert_eq!(req.step, AgentStep::Drift);
        assert_eq!(req.model.as_deref(), Some("haiku"));
        assert_eq!(req.label, "auth");
    }

    #[test]
    fn test_searchable_falls_back_to_raw() {
        let out = AgentOutput {
            text: String::new(),
            raw: "BUILD_FAILED: x".into(),
            exit_code: 1,
            usage: None,
        };
        assert_eq!(out.searchable(), "BUILD_FAILED: x");
    }

    #[test]
    fn test_usage_total() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        assert_eq!(usage.total(), 15);
    }
}
