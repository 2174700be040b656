//! Resume checkpoints.
//!
//! The build loop writes a checkpoint after every validated feature so a
//! crashed or interrupted run can continue without rebuilding anything. The
//! store is injected into the driver; the file-backed store only ever
//! replaces the checkpoint atomically.

use crate::settings::BranchStrategy;
use crate::util::atomic_write_json;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Position in the build order of the next feature to attempt.
    pub feature_index: usize,
    pub branch_strategy: BranchStrategy,
    #[serde(default)]
    pub completed_features: Vec<String>,
    /// Chain head at checkpoint time.
    pub current_branch: String,
    pub timestamp: DateTime<Utc>,
}

impl ResumeState {
    pub fn new(branch_strategy: BranchStrategy) -> Self {
        Self {
            feature_index: 0,
            branch_strategy,
            completed_features: Vec::new(),
            current_branch: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.completed_features.iter().any(|f| f == name)
    }

    /// Record a validated feature and advance the index past it.
    pub fn record(&mut self, name: &str, next_index: usize, current_branch: &str) {
        if !self.is_completed(name) {
            self.completed_features.push(name.to_string());
        }
        self.feature_index = next_index;
        self.current_branch = current_branch.to_string();
        self.timestamp = Utc::now();
    }
}

/// Durable home of the resume checkpoint.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<ResumeState>>;
    fn save(&self, state: &ResumeState) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Checkpoint in `.sdd-state/resume.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<ResumeState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let state = serde_json::from_str(&content).with_context(|| {
            format!(
                "Resume checkpoint {} is corrupt; delete it or run without --resume",
                self.path.display()
            )
        })?;
        Ok(Some(state))
    }

    fn save(&self, state: &ResumeState) -> Result<()> {
        atomic_write_json(&self.path, state)
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// In-process store; also records every save.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    current: Mutex<Option<ResumeState>>,
    history: Mutex<Vec<ResumeState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ResumeState) -> Self {
        Self {
            current: Mutex::new(Some(state)),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Option<ResumeState> {
        self.current.lock().ok().and_then(|s| s.clone())
    }

    pub fn saves(&self) -> Vec<ResumeState> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<ResumeState>> {
        Ok(self.current())
    }

    fn save(&self, state: &ResumeState) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("state store poisoned"))?;
        *current = Some(state.clone());
        if let Ok(mut history) = self.history.lock() {
            history.push(state.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("state store poisoned"))?;
        *current = None;
        Ok(())
    }
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<ResumeState>> {
        (**self).load()
    }

    fn save(&self, state: &ResumeState) -> Result<()> {
        (**self).save(state)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_store_roundtrip_and_clear() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join(".sdd-state/resume.json"));
        assert!(store.load().unwrap().is_none());

        let mut state = ResumeState::new(BranchStrategy::Chained);
        state.record("Auth", 1, "auto-sdd/feature-1-auth");
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.completed_features, vec!["Auth"]);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_file_format_uses_plain_fields() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("resume.json"));
        let mut state = ResumeState::new(BranchStrategy::Independent);
        state.record("Feed", 3, "main");
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["feature_index"], 3);
        assert_eq!(raw["branch_strategy"], "independent");
        assert_eq!(raw["completed_features"][0], "Feed");
        assert_eq!(raw["current_branch"], "main");
        assert!(raw["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileStateStore::new(&path).load().unwrap_err();
        assert!(format!("{:#}", err).contains("corrupt"));
    }

    #[test]
    fn test_record_is_idempotent_per_name() {
        let mut state = ResumeState::new(BranchStrategy::Chained);
        state.record("Auth", 1, "b1");
        state.record("Auth", 2, "b1");
        assert_eq!(state.completed_features.len(), 1);
        assert_eq!(state.feature_index, 2);
    }

    #[test]
    fn test_memory_store_keeps_history() {
        let store = MemoryStateStore::new();
        let mut state = ResumeState::new(BranchStrategy::Chained);
        state.record("A", 1, "b");
        store.save(&state).unwrap();
        state.record("B", 2, "c");
        store.save(&state).unwrap();
        assert_eq!(store.saves().len(), 2);
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
