//! Roadmap table parsing and status rewriting.
//!
//! Rows look like:
//!
//! ```text
//! | 3 | Dashboard | spec | PROJ-12 | M | 1, 2 | ⬜ |
//! ```
//!
//! Columns: id, name, source, issue reference, complexity, dependency ids,
//! status glyph. Any line that does not start with `| <digits> |` is prose and
//! is preserved untouched when a status is rewritten.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static ROW_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\|\s*(\d+)\s*\|").unwrap());

/// Feature lifecycle status, encoded in the roadmap as a glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Unknown,
}

impl FeatureStatus {
    pub fn from_cell(cell: &str) -> Self {
        if cell.contains('\u{2705}') {
            FeatureStatus::Completed
        } else if cell.contains('\u{2b1c}') {
            FeatureStatus::Pending
        } else if cell.contains('\u{1f504}') {
            FeatureStatus::InProgress
        } else if cell.contains('\u{23f8}') {
            FeatureStatus::Blocked
        } else if cell.contains('\u{274c}') {
            FeatureStatus::Cancelled
        } else {
            FeatureStatus::Unknown
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            FeatureStatus::Pending => "\u{2b1c}",
            FeatureStatus::InProgress => "\u{1f504}",
            FeatureStatus::Completed => "\u{2705}",
            FeatureStatus::Blocked => "\u{23f8}\u{fe0f}",
            FeatureStatus::Cancelled => "\u{274c}",
            FeatureStatus::Unknown => "?",
        }
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::InProgress => "in progress",
            FeatureStatus::Completed => "completed",
            FeatureStatus::Blocked => "blocked",
            FeatureStatus::Cancelled => "cancelled",
            FeatureStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One roadmap row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: u32,
    pub name: String,
    pub source: String,
    pub issue: String,
    pub complexity: String,
    pub deps: Vec<u32>,
    pub status: FeatureStatus,
}

impl Feature {
    /// Branch-safe identifier, e.g. `feature-3-user-auth`.
    pub fn slug(&self) -> String {
        format!("feature-{}-{}", self.id, crate::util::slugify(&self.name))
    }
}

/// Parse the dependency column. `-` or blank means none; each comma part is
/// reduced to its digits. Repeated ids are kept once, in first-seen order.
pub fn parse_deps(cell: &str) -> Vec<u32> {
    let cell = cell.trim();
    if cell.is_empty() || cell == "-" {
        return Vec::new();
    }
    let mut deps: Vec<u32> = Vec::new();
    for part in cell.split(',') {
        let digits: String = part.chars().filter(char::is_ascii_digit).collect();
        if let Ok(id) = digits.parse()
            && !deps.contains(&id)
        {
            deps.push(id);
        }
    }
    deps
}

fn split_row(line: &str) -> Option<Vec<&str>> {
    if !ROW_REGEX.is_match(line) {
        return None;
    }
    let cols: Vec<&str> = line.split('|').map(str::trim).collect();
    // ['', id, name, source, issue, complexity, deps, status, '']
    if cols.len() < 9 {
        return None;
    }
    Some(cols)
}

/// Parse roadmap markdown into features, in file order.
pub fn parse_roadmap(content: &str) -> Vec<Feature> {
    content
        .lines()
        .filter_map(|line| {
            let cols = split_row(line)?;
            let id = cols[1].parse().ok()?;
            Some(Feature {
                id,
                name: cols[2].to_string(),
                source: cols[3].to_string(),
                issue: cols[4].to_string(),
                complexity: cols[5].to_string(),
                deps: parse_deps(cols[6]),
                status: FeatureStatus::from_cell(cols[7]),
            })
        })
        .collect()
}

/// A roadmap file on disk.
#[derive(Debug, Clone)]
pub struct Roadmap {
    path: PathBuf,
    features: Vec<Feature>,
}

impl Roadmap {
    /// Load a roadmap. A missing file is an empty roadmap.
    pub fn load(path: &Path) -> Result<Self> {
        let features = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read roadmap {}", path.display()))?;
            parse_roadmap(&content)
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            features,
        })
    }

    pub fn from_features(path: impl Into<PathBuf>, features: Vec<Feature>) -> Self {
        Self {
            path: path.into(),
            features,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn get(&self, id: u32) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Feature> {
        self.features
            .iter()
            .filter(|f| f.status == FeatureStatus::Pending)
    }
}

/// Rewrite the status cell of row `id` in the roadmap at `path`, keeping
/// every other byte of the file. Returns `false` if no such row exists.
pub fn set_status(path: &Path, id: u32, status: FeatureStatus) -> Result<bool> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read roadmap {}", path.display()))?;
    let (updated, changed) = rewrite_status(&content, id, status);
    if changed {
        crate::util::atomic_write(path, updated.as_bytes())?;
    }
    Ok(changed)
}

/// Pure form of [`set_status`].
pub fn rewrite_status(content: &str, id: u32, status: FeatureStatus) -> (String, bool) {
    let mut changed = false;
    let mut out = String::with_capacity(content.len() + 8);

    for chunk in content.split_inclusive('\n') {
        let (line, ending) = match chunk.strip_suffix("\r\n") {
            Some(l) => (l, "\r\n"),
            None => match chunk.strip_suffix('\n') {
                Some(l) => (l, "\n"),
                None => (chunk, ""),
            },
        };

        let is_target = split_row(line)
            .and_then(|cols| cols[1].parse::<u32>().ok())
            .is_some_and(|row_id| row_id == id);

        if !is_target {
            out.push_str(chunk);
            continue;
        }

        // Status is the 7th cell, between the 7th and 8th pipes.
        let pipes: Vec<usize> = line.match_indices('|').map(|(i, _)| i).collect();
        if pipes.len() < 8 {
            out.push_str(chunk);
            continue;
        }
        let (start, end) = (pipes[6], pipes[7]);
        out.push_str(&line[..=start]);
        out.push(' ');
        out.push_str(status.glyph());
        out.push(' ');
        out.push_str(&line[end..]);
        out.push_str(ending);
        changed = true;
    }

    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ROADMAP: &str = "# Roadmap\n\n| # | Feature | Source | Jira | Complexity | Deps | Status |\n|---|---------|--------|------|------------|------|--------|\n| 1 | Auth | spec | A-1 | S | - | \u{2705} |\n| 2 | Profile Page | spec | A-2 | M | 1 | \u{2b1c} |\n| 3 | Dashboard | spec | A-3 | L | 1, 2 | \u{2b1c} |\n| 4 | Billing | spec | A-4 | M | #2,#9 | \u{23f8}\u{fe0f} |\n\nNotes stay.\n";

    #[test]
    fn test_parse_rows() {
        let features = parse_roadmap(ROADMAP);
        assert_eq!(features.len(), 4);
        assert_eq!(features[0].status, FeatureStatus::Completed);
        assert_eq!(features[1].name, "Profile Page");
        assert_eq!(features[1].complexity, "M");
        assert_eq!(features[2].deps, vec![1, 2]);
        assert_eq!(features[3].deps, vec![2, 9]);
        assert_eq!(features[3].status, FeatureStatus::Blocked);
    }

    #[test]
    fn test_header_and_separator_rows_are_skipped() {
        let features = parse_roadmap("| # | Feature |\n|---|---|\n| x | y | z | a | b | c | d |\n");
        assert!(features.is_empty());
    }

    #[test]
    fn test_short_rows_are_skipped() {
        assert!(parse_roadmap("| 1 | Auth | S |\n").is_empty());
    }

    #[test]
    fn test_parse_deps_variants() {
        assert!(parse_deps("-").is_empty());
        assert!(parse_deps("  ").is_empty());
        assert_eq!(parse_deps("1,2 , 3"), vec![1, 2, 3]);
        assert_eq!(parse_deps("F-7, x"), vec![7]);
        assert_eq!(parse_deps("#1, 1, 2, #2"), vec![1, 2]);
    }

    #[test]
    fn test_status_glyphs() {
        assert_eq!(FeatureStatus::from_cell("\u{1f504}"), FeatureStatus::InProgress);
        assert_eq!(FeatureStatus::from_cell("\u{274c} dropped"), FeatureStatus::Cancelled);
        assert_eq!(FeatureStatus::from_cell("todo"), FeatureStatus::Unknown);
        for s in [
            FeatureStatus::Pending,
            FeatureStatus::InProgress,
            FeatureStatus::Completed,
            FeatureStatus::Blocked,
            FeatureStatus::Cancelled,
        ] {
            assert_eq!(FeatureStatus::from_cell(s.glyph()), s);
        }
    }

    #[test]
    fn test_rewrite_status_touches_only_target_cell() {
        let (updated, changed) = rewrite_status(ROADMAP, 2, FeatureStatus::Completed);
        assert!(changed);
        let features = parse_roadmap(&updated);
        assert_eq!(features[1].status, FeatureStatus::Completed);
        assert_eq!(features[2].status, FeatureStatus::Pending);
        assert!(updated.contains("| 2 | Profile Page | spec | A-2 | M | 1 | \u{2705} |\n"));
        assert!(updated.ends_with("\nNotes stay.\n"));
        assert_eq!(updated.lines().count(), ROADMAP.lines().count());
    }

    #[test]
    fn test_rewrite_status_missing_id() {
        let (updated, changed) = rewrite_status(ROADMAP, 99, FeatureStatus::Completed);
        assert!(!changed);
        assert_eq!(updated, ROADMAP);
    }

    #[test]
    fn test_set_status_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roadmap.md");
        std::fs::write(&path, ROADMAP).unwrap();
        assert!(set_status(&path, 3, FeatureStatus::InProgress).unwrap());
        let roadmap = Roadmap::load(&path).unwrap();
        assert_eq!(roadmap.get(3).unwrap().status, FeatureStatus::InProgress);
        assert_eq!(roadmap.pending().count(), 1);
    }

    #[test]
    fn test_missing_roadmap_is_empty() {
        let dir = tempdir().unwrap();
        let roadmap = Roadmap::load(&dir.path().join("nope.md")).unwrap();
        assert!(roadmap.features().is_empty());
    }

    #[test]
    fn test_feature_slug() {
        let f = parse_roadmap(ROADMAP).remove(1);
        assert_eq!(f.slug(), "feature-2-profile-page");
    }
}
