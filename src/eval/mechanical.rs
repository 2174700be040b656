//! Agent-free analysis of a single commit.

use crate::errors::EvalError;
use git2::{Commit, DiffFormat, ObjectType, Repository, Tree, TreeWalkMode, TreeWalkResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

static SUBJECT_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^:]*:\s*").unwrap());
static TYPE_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:export\s+(?:type|interface)|pub\s+(?:struct|enum|trait|type))\s+(\w+)").unwrap()
});

/// File extensions whose type declarations are tracked.
const DECLARING_EXTENSIONS: &[&str] = &["ts", "tsx", "rs"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechanicalEval {
    pub commit: String,
    pub feature_name: String,
    pub files_changed: usize,
    pub files: Vec<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub new_type_exports: usize,
    pub type_redeclarations: usize,
    pub redeclared_type_names: Vec<String>,
    pub import_count: usize,
    pub test_files_touched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCommit {
    pub commit: String,
    pub skipped: bool,
    pub reason: String,
}

/// Result of the mechanical pass. Merge commits are not analysed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mechanical {
    Skipped(SkippedCommit),
    Evaluated(MechanicalEval),
}

impl Mechanical {
    pub fn commit(&self) -> &str {
        match self {
            Mechanical::Skipped(s) => &s.commit,
            Mechanical::Evaluated(e) => &e.commit,
        }
    }

    pub fn evaluated(&self) -> Option<&MechanicalEval> {
        match self {
            Mechanical::Evaluated(e) => Some(e),
            Mechanical::Skipped(_) => None,
        }
    }
}

/// Commit subject with a leading `type:` style prefix removed.
pub fn feature_name_from_subject(subject: &str) -> String {
    SUBJECT_PREFIX.replace(subject.trim(), "").into_owned()
}

pub fn is_test_file(path: &str) -> bool {
    path.contains("test") || path.contains("spec") || path.contains("__tests__")
}

/// Declared type names in `text`, first occurrence order, deduplicated.
pub fn declared_type_names<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for line in lines {
        for caps in TYPE_DECL.captures_iter(line) {
            let name = caps[1].to_string();
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
    }
    names
}

pub(crate) fn find_commit<'r>(repo: &'r Repository, sha: &str) -> Result<Commit<'r>, EvalError> {
    repo.revparse_single(sha)
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|_| EvalError::CommitNotFound { sha: sha.to_string() })
}

fn parent_tree<'r>(commit: &Commit<'r>) -> Result<Option<Tree<'r>>, EvalError> {
    if commit.parent_count() == 0 {
        return Ok(None);
    }
    Ok(Some(commit.parent(0)?.tree()?))
}

/// Unified diff of `sha` against its first parent (or the empty tree).
pub fn commit_diff(repo: &Repository, sha: &str) -> Result<String, EvalError> {
    let commit = find_commit(repo, sha)?;
    let old = parent_tree(&commit)?;
    let diff = repo.diff_tree_to_tree(old.as_ref(), Some(&commit.tree()?), None)?;

    let mut buf = Vec::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            buf.push(line.origin() as u8);
        }
        buf.extend_from_slice(line.content());
        true
    })?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Names declared anywhere in `tree`, restricted to tracked extensions.
fn declared_in_tree(repo: &Repository, tree: &Tree<'_>) -> Result<HashSet<String>, EvalError> {
    let mut blobs = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        let is_source = entry.name().is_some_and(|name| {
            DECLARING_EXTENSIONS
                .iter()
                .any(|ext| name.rsplit_once('.').is_some_and(|(_, e)| e == *ext))
        });
        if entry.kind() == Some(ObjectType::Blob) && is_source {
            blobs.push((format!("{}{}", root, entry.name().unwrap_or_default()), entry.id()));
        }
        TreeWalkResult::Ok
    })?;

    let mut names = HashSet::new();
    for (_path, id) in blobs {
        let blob = repo.find_blob(id)?;
        if blob.is_binary() {
            continue;
        }
        let content = String::from_utf8_lossy(blob.content());
        names.extend(declared_type_names(content.lines()));
    }
    Ok(names)
}

/// Run the mechanical pass over `sha`.
pub fn run_mechanical_eval(repo: &Repository, sha: &str) -> Result<Mechanical, EvalError> {
    let commit = find_commit(repo, sha)?;
    let commit_id = commit.id().to_string();
    if commit.parent_count() > 1 {
        return Ok(Mechanical::Skipped(SkippedCommit {
            commit: commit_id,
            skipped: true,
            reason: "merge commit".to_string(),
        }));
    }

    let feature_name = feature_name_from_subject(commit.summary().unwrap_or_default());
    let old = parent_tree(&commit)?;
    let diff = repo.diff_tree_to_tree(old.as_ref(), Some(&commit.tree()?), None)?;

    let files: Vec<String> = diff
        .deltas()
        .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let stats = diff.stats()?;

    let mut added_lines = Vec::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if line.origin() == '+' {
            added_lines.push(String::from_utf8_lossy(line.content()).into_owned());
        }
        true
    })?;

    let new_types = declared_type_names(added_lines.iter().map(String::as_str));
    let redeclared: Vec<String> = match &old {
        Some(tree) if !new_types.is_empty() => {
            let existing = declared_in_tree(repo, tree)?;
            new_types
                .iter()
                .filter(|name| existing.contains(*name))
                .cloned()
                .collect()
        }
        _ => Vec::new(),
    };
    let import_count = added_lines.iter().filter(|l| l.contains("import ")).count();

    Ok(Mechanical::Evaluated(MechanicalEval {
        commit: commit_id,
        feature_name,
        files_changed: files.len(),
        test_files_touched: files.iter().any(|f| is_test_file(f)),
        files,
        lines_added: stats.insertions(),
        lines_removed: stats.deletions(),
        new_type_exports: new_types.len(),
        type_redeclarations: redeclared.len(),
        redeclared_type_names: redeclared,
        import_count,
    }))
}
