//! In-memory fakes for the agent, git and check seams.

use crate::agent::{Agent, AgentOutput, AgentRequest, AgentStep};
use crate::errors::LoopError;
use crate::validation::{CheckKind, CheckOutcome, CheckRunner};
use crate::workspace::Git;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ============================================================================
// Git
// ============================================================================

#[derive(Default)]
struct GitState {
    branches: HashMap<String, String>,
    current: String,
    head: String,
    dirty: bool,
    next_sha: u32,
    stashes: Vec<String>,
    calls: Vec<String>,
    created: Vec<(String, String)>,
    worktrees: Vec<(String, String, String)>,
    commits: Vec<String>,
}

impl GitState {
    fn new_sha(&mut self) -> String {
        self.next_sha += 1;
        format!("c{}", self.next_sha)
    }
}

/// Single-checkout repository model. Worktree directories share the one
/// head, which is all the callers under test observe.
#[derive(Clone, Default)]
pub struct FakeGit {
    state: Arc<Mutex<GitState>>,
}

impl FakeGit {
    pub fn new(base: &str) -> Self {
        let mut state = GitState {
            current: base.to_string(),
            head: "c0".to_string(),
            ..Default::default()
        };
        state.branches.insert(base.to_string(), "c0".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut GitState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.with(|s| s.dirty = dirty);
    }

    pub fn add_branch(&self, name: &str) {
        self.with(|s| {
            let head = s.head.clone();
            s.branches.insert(name.to_string(), head);
        });
    }

    /// Simulate a commit made by someone else (e.g. the agent).
    pub fn commit_on_head(&self) -> String {
        self.with(|s| {
            let sha = s.new_sha();
            s.head = sha.clone();
            let current = s.current.clone();
            s.branches.insert(current, sha.clone());
            sha
        })
    }

    pub fn head(&self) -> String {
        self.with(|s| s.head.clone())
    }

    pub fn current(&self) -> String {
        self.with(|s| s.current.clone())
    }

    pub fn stash_count(&self) -> usize {
        self.with(|s| s.stashes.len())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn created_branches(&self) -> Vec<(String, String)> {
        self.with(|s| s.created.clone())
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.with(|s| {
            let mut names: Vec<String> = s.branches.keys().cloned().collect();
            names.sort();
            names
        })
    }

    pub fn worktrees(&self) -> Vec<(String, String, String)> {
        self.with(|s| s.worktrees.clone())
    }

    pub fn commits(&self) -> Vec<String> {
        self.with(|s| s.commits.clone())
    }
}

#[async_trait]
impl Git for FakeGit {
    async fn current_branch(&self, _dir: &Path) -> Result<String> {
        Ok(self.current())
    }

    async fn head_sha(&self, _dir: &Path) -> Result<String> {
        Ok(self.head())
    }

    async fn is_clean(&self, _dir: &Path) -> Result<bool> {
        Ok(self.with(|s| !s.dirty))
    }

    async fn branch_exists(&self, _dir: &Path, branch: &str) -> Result<bool> {
        Ok(self.with(|s| s.branches.contains_key(branch)))
    }

    async fn stash(&self, _dir: &Path, message: &str) -> Result<bool> {
        Ok(self.with(|s| {
            s.calls.push(format!("stash {}", message));
            if !s.dirty {
                return false;
            }
            s.dirty = false;
            s.stashes.push(message.to_string());
            true
        }))
    }

    async fn create_branch(&self, _dir: &Path, branch: &str, from: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("create_branch {} {}", branch, from));
            let Some(sha) = s.branches.get(from).cloned() else {
                return Err(LoopError::Git {
                    command: format!("checkout -b {} {}", branch, from),
                    stderr: format!("fatal: '{}' is not a commit", from),
                }
                .into());
            };
            s.branches.insert(branch.to_string(), sha.clone());
            s.head = sha;
            s.current = branch.to_string();
            s.created.push((branch.to_string(), from.to_string()));
            Ok(())
        })
    }

    async fn checkout(&self, _dir: &Path, branch: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("checkout {}", branch));
            match s.branches.get(branch).cloned() {
                Some(sha) => {
                    s.head = sha;
                    s.current = branch.to_string();
                    Ok(())
                }
                None => bail!("no such branch {}", branch),
            }
        })
    }

    async fn branch_at(&self, _dir: &Path, branch: &str, sha: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("branch_at {} {}", branch, sha));
            s.branches.insert(branch.to_string(), sha.to_string());
        });
        Ok(())
    }

    async fn reset_hard(&self, _dir: &Path, sha: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("reset_hard {}", sha));
            s.head = sha.to_string();
            s.dirty = false;
            let current = s.current.clone();
            s.branches.insert(current, sha.to_string());
        });
        Ok(())
    }

    async fn clean(&self, dir: &Path) -> Result<()> {
        self.with(|s| s.calls.push(format!("clean {}", dir.display())));
        Ok(())
    }

    async fn worktree_add(&self, _repo: &Path, path: &Path, branch: &str, from: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("worktree_add {} {}", path.display(), branch));
            let sha = s.branches.get(from).cloned().unwrap_or_else(|| s.head.clone());
            s.branches.insert(branch.to_string(), sha);
            s.worktrees.push((
                path.display().to_string(),
                branch.to_string(),
                from.to_string(),
            ));
        });
        Ok(())
    }

    async fn worktree_remove(&self, _repo: &Path, path: &Path) -> Result<()> {
        self.with(|s| s.calls.push(format!("worktree_remove {}", path.display())));
        Ok(())
    }

    async fn commit_all(&self, _dir: &Path, message: &str) -> Result<bool> {
        Ok(self.with(|s| {
            if !s.dirty {
                return false;
            }
            let sha = s.new_sha();
            s.head = sha.clone();
            let current = s.current.clone();
            s.branches.insert(current, sha);
            s.dirty = false;
            s.commits.push(message.to_string());
            true
        }))
    }

    async fn ensure_excluded(&self, _dir: &Path, patterns: &[&str]) -> Result<()> {
        self.with(|s| s.calls.push(format!("ensure_excluded {}", patterns.join(" "))));
        Ok(())
    }
}

// ============================================================================
// Agent
// ============================================================================

type Effect = Box<dyn Fn(&AgentRequest) + Send + Sync>;

enum Reply {
    Output(AgentOutput),
    RateLimited,
    CreditExhausted,
}

struct Scripted {
    reply: Reply,
    effect: Option<Effect>,
}

/// Agent that answers from per-step queues. Build and retry share a queue.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    queues: Arc<Mutex<HashMap<AgentStep, VecDeque<Scripted>>>>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
}

fn queue_key(step: AgentStep) -> AgentStep {
    match step {
        AgentStep::Retry => AgentStep::Build,
        other => other,
    }
}

fn text_output(text: &str, exit_code: i32) -> AgentOutput {
    AgentOutput {
        text: text.to_string(),
        raw: text.to_string(),
        exit_code,
        usage: None,
    }
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, step: AgentStep, scripted: Scripted) {
        self.queues
            .lock()
            .unwrap()
            .entry(queue_key(step))
            .or_default()
            .push_back(scripted);
    }

    pub fn push_text(&self, step: AgentStep, text: &str) {
        self.push_output(step, text_output(text, 0));
    }

    pub fn push_output(&self, step: AgentStep, output: AgentOutput) {
        self.push(
            step,
            Scripted {
                reply: Reply::Output(output),
                effect: None,
            },
        );
    }

    pub fn push_with_effect(
        &self,
        step: AgentStep,
        text: &str,
        effect: impl Fn(&AgentRequest) + Send + Sync + 'static,
    ) {
        self.push(
            step,
            Scripted {
                reply: Reply::Output(text_output(text, 0)),
                effect: Some(Box::new(effect)),
            },
        );
    }

    pub fn push_rate_limited(&self, step: AgentStep) {
        self.push(
            step,
            Scripted {
                reply: Reply::RateLimited,
                effect: None,
            },
        );
    }

    pub fn push_credit_exhausted(&self, step: AgentStep) {
        self.push(
            step,
            Scripted {
                reply: Reply::CreditExhausted,
                effect: None,
            },
        );
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<AgentStep> {
        self.requests().iter().map(|r| r.step).collect()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&queue_key(request.step))
            .and_then(VecDeque::pop_front);

        let Some(scripted) = next else {
            let fallback = match request.step {
                AgentStep::Build | AgentStep::Retry => "BUILD_FAILED: no scripted reply",
                AgentStep::Drift => "NO_DRIFT",
                AgentStep::Review => "REVIEW_CLEAN",
                AgentStep::Eval => "",
            };
            return Ok(text_output(fallback, 0));
        };

        if let Some(effect) = &scripted.effect {
            effect(request);
        }
        match scripted.reply {
            Reply::Output(output) => Ok(output),
            Reply::RateLimited => Err(LoopError::RateLimitExhausted { attempts: 6 }.into()),
            Reply::CreditExhausted => Ok(text_output(
                "Error: Your credit balance is too low to access the API",
                1,
            )),
        }
    }
}

// ============================================================================
// Checks
// ============================================================================

/// Checks that pass unless a scripted outcome is queued for the kind.
#[derive(Clone, Default)]
pub struct ScriptedChecks {
    queues: Arc<Mutex<HashMap<CheckKind, VecDeque<CheckOutcome>>>>,
    calls: Arc<Mutex<Vec<(CheckKind, PathBuf)>>>,
}

impl ScriptedChecks {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn push(&self, kind: CheckKind, outcome: CheckOutcome) {
        self.queues
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CheckRunner for ScriptedChecks {
    async fn run(&self, kind: CheckKind, dir: &Path) -> Result<CheckOutcome> {
        self.calls.lock().unwrap().push((kind, dir.to_path_buf()));
        let next = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| {
            let outcome = CheckOutcome::pass("ok");
            match kind {
                CheckKind::Test => outcome.with_test_count(3),
                CheckKind::Build => outcome,
            }
        }))
    }
}
