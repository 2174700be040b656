//! Claude CLI adapter.

use super::{Agent, AgentOutput, AgentRequest, Usage};
use crate::errors::LoopError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Per-model token counts from `modelUsage`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelUsage {
    #[serde(default, rename = "inputTokens", alias = "input_tokens")]
    pub input_tokens: u64,
    #[serde(default, rename = "outputTokens", alias = "output_tokens")]
    pub output_tokens: u64,
}

/// The JSON document printed by `claude --output-format json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeJson {
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub usage: Option<Usage>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub session_id: Option<String>,
    pub stop_reason: Option<String>,
    #[serde(default, rename = "modelUsage")]
    pub model_usage: HashMap<String, ModelUsage>,
}

/// Model with the highest input+output token total, or `"unknown"`.
pub fn dominant_model(usage: &HashMap<String, ModelUsage>) -> String {
    usage
        .iter()
        .max_by(|a, b| {
            let ta = a.1.input_tokens + a.1.output_tokens;
            let tb = b.1.input_tokens + b.1.output_tokens;
            ta.cmp(&tb).then_with(|| b.0.cmp(a.0))
        })
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// One line of `cost-log.jsonl`.
#[derive(Debug, Clone, Serialize)]
struct CostRecord<'a> {
    timestamp: String,
    step: String,
    label: &'a str,
    cost_usd: Option<f64>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_tokens: Option<u64>,
    cache_read_tokens: Option<u64>,
    duration_ms: Option<u64>,
    duration_api_ms: Option<u64>,
    num_turns: Option<u64>,
    model: String,
    session_id: Option<&'a str>,
    stop_reason: Option<&'a str>,
}

impl<'a> CostRecord<'a> {
    fn from_json(json: &'a ClaudeJson, request: &'a AgentRequest) -> Self {
        let usage = json.usage.as_ref();
        Self {
            timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            step: request.step.to_string(),
            label: &request.label,
            cost_usd: json.total_cost_usd,
            input_tokens: usage.map(|u| u.input_tokens),
            output_tokens: usage.map(|u| u.output_tokens),
            cache_creation_tokens: usage.map(|u| u.cache_creation_input_tokens),
            cache_read_tokens: usage.map(|u| u.cache_read_input_tokens),
            duration_ms: json.duration_ms,
            duration_api_ms: json.duration_api_ms,
            num_turns: json.num_turns,
            model: dominant_model(&json.model_usage),
            session_id: json.session_id.as_deref(),
            stop_reason: json.stop_reason.as_deref(),
        }
    }
}

/// Runs the Claude CLI in print mode with JSON output.
pub struct ClaudeAgent {
    claude_cmd: String,
    log_dir: PathBuf,
    cost_log: Option<PathBuf>,
    sequence: AtomicU64,
}

impl ClaudeAgent {
    /// `log_dir` receives one prompt and one output file per invocation.
    pub fn new(claude_cmd: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            log_dir: log_dir.into(),
            cost_log: None,
            sequence: AtomicU64::new(0),
        }
    }

    /// Append a JSONL cost record per invocation to `path`.
    pub fn with_cost_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.cost_log = Some(path.into());
        self
    }

    pub fn flags(model: Option<&str>) -> Vec<String> {
        let mut flags = vec![
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = model {
            flags.push("--model".to_string());
            flags.push(model.to_string());
        }
        flags
    }

    fn append_cost(&self, record: &CostRecord<'_>) -> Result<()> {
        let Some(path) = &self.cost_log else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open cost log {}", path.display()))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stem = format!(
            "{}-{:03}-{}-{}",
            crate::util::file_timestamp(),
            seq,
            crate::util::slugify(&request.label),
            request.step
        );
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {}", self.log_dir.display()))?;
        let prompt_file = self.log_dir.join(format!("{}-prompt.md", stem));
        let output_file = self.log_dir.join(format!("{}-output.log", stem));
        std::fs::write(&prompt_file, &request.prompt).context("Failed to write prompt file")?;

        let flags = Self::flags(request.model.as_deref());
        info!(
            step = %request.step,
            label = %request.label,
            workdir = %request.workdir.display(),
            "Invoking agent: {} {}",
            self.claude_cmd,
            flags.join(" ")
        );

        let start = Instant::now();
        let mut child = match Command::new(&self.claude_cmd)
            .args(&flags)
            .env_remove("CLAUDECODE")
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoopError::MissingTool {
                    tool: self.claude_cmd.clone(),
                }
                .into());
            }
            Err(e) => return Err(e).context("Failed to spawn agent process"),
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent process")?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let raw = format!("{}{}", stdout, stderr);

        let parsed = serde_json::from_str::<ClaudeJson>(stdout.trim()).ok();
        let (text, usage) = match &parsed {
            Some(json) if json.result.is_some() => {
                if let Err(e) = self.append_cost(&CostRecord::from_json(json, request)) {
                    warn!("Failed to append cost log: {:#}", e);
                }
                if json.is_error {
                    debug!(step = %request.step, "Agent reported is_error");
                }
                (json.result.clone().unwrap_or_default(), json.usage.clone())
            }
            _ => (raw.clone(), None),
        };

        std::fs::write(&output_file, &raw).context("Failed to write output file")?;
        info!(
            step = %request.step,
            exit_code,
            elapsed_secs = start.elapsed().as_secs(),
            output = %output_file.display(),
            "Agent finished"
        );

        Ok(AgentOutput {
            text,
            raw,
            exit_code,
            usage,
        })
    }
}
