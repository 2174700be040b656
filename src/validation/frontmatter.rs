//! Feature spec frontmatter checks.

use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MARKER: &str = "---";
const MAX_HEADER_LINES: usize = 20;
pub const REQUIRED_FIELDS: [&str; 2] = ["domain", "feature"];

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("{path}: could not read file: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: missing opening --- marker")]
    MissingOpening { path: PathBuf },
    #[error("{path}: missing closing --- marker in first {MAX_HEADER_LINES} lines")]
    MissingClosing { path: PathBuf },
    #[error("{path}: frontmatter is not valid YAML: {source}")]
    InvalidYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: missing required field '{field}'")]
    MissingField { path: PathBuf, field: &'static str },
}

/// Parsed spec header.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecFrontmatter {
    pub feature: String,
    pub domain: String,
    pub status: Option<String>,
    pub fields: Mapping,
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Check that `path` starts with a `---` delimited YAML block, closed within
/// the first 20 lines, that names at least `feature` and `domain`.
pub fn validate_frontmatter(path: &Path) -> Result<SpecFrontmatter, SpecError> {
    let content = std::fs::read_to_string(path).map_err(|source| SpecError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse_frontmatter(&content).map_err(|e| e.at(path))
}

/// Error without a path yet; attached by [`validate_frontmatter`].
#[derive(Debug)]
pub enum FrontmatterIssue {
    MissingOpening,
    MissingClosing,
    InvalidYaml(serde_yaml::Error),
    MissingField(&'static str),
}

impl FrontmatterIssue {
    fn at(self, path: &Path) -> SpecError {
        let path = path.to_path_buf();
        match self {
            FrontmatterIssue::MissingOpening => SpecError::MissingOpening { path },
            FrontmatterIssue::MissingClosing => SpecError::MissingClosing { path },
            FrontmatterIssue::InvalidYaml(source) => SpecError::InvalidYaml { path, source },
            FrontmatterIssue::MissingField(field) => SpecError::MissingField { path, field },
        }
    }
}

/// Pure form of [`validate_frontmatter`].
pub fn parse_frontmatter(content: &str) -> Result<SpecFrontmatter, FrontmatterIssue> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.first().map(|l| l.trim_end()) != Some(MARKER) {
        return Err(FrontmatterIssue::MissingOpening);
    }
    let close = lines
        .iter()
        .take(MAX_HEADER_LINES)
        .skip(1)
        .position(|l| l.trim_end() == MARKER)
        .map(|i| i + 1)
        .ok_or(FrontmatterIssue::MissingClosing)?;

    let yaml = lines[1..close].join("\n");
    let fields: Mapping = if yaml.trim().is_empty() {
        Mapping::new()
    } else {
        match serde_yaml::from_str::<Value>(&yaml).map_err(FrontmatterIssue::InvalidYaml)? {
            Value::Mapping(m) => m,
            _ => Mapping::new(),
        }
    };

    for field in REQUIRED_FIELDS {
        if !fields.contains_key(field) {
            return Err(FrontmatterIssue::MissingField(field));
        }
    }

    let get = |key: &str| fields.get(key).map(scalar_string);
    Ok(SpecFrontmatter {
        feature: get("feature").unwrap_or_default(),
        domain: get("domain").unwrap_or_default(),
        status: get("status"),
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_frontmatter() {
        let fm = parse_frontmatter(
            "---\nfeature: User Auth\ndomain: identity\nstatus: draft\n---\n# Body\n",
        )
        .unwrap();
        assert_eq!(fm.feature, "User Auth");
        assert_eq!(fm.domain, "identity");
        assert_eq!(fm.status.as_deref(), Some("draft"));
    }

    #[test]
    fn test_missing_opening_marker() {
        assert!(matches!(
            parse_frontmatter("# Title\n---\nfeature: x\n---\n"),
            Err(FrontmatterIssue::MissingOpening)
        ));
    }

    #[test]
    fn test_closing_marker_must_be_within_header() {
        let mut content = String::from("---\nfeature: x\ndomain: y\n");
        for i in 0..20 {
            content.push_str(&format!("note{}: z\n", i));
        }
        content.push_str("---\n");
        assert!(matches!(
            parse_frontmatter(&content),
            Err(FrontmatterIssue::MissingClosing)
        ));
    }

    #[test]
    fn test_missing_required_field() {
        match parse_frontmatter("---\nfeature: x\n---\n") {
            Err(FrontmatterIssue::MissingField(field)) => assert_eq!(field, "domain"),
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_frontmatter_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.feature.md");
        std::fs::write(&path, "no frontmatter\n").unwrap();
        let err = validate_frontmatter(&path).unwrap_err();
        assert!(err.to_string().contains("spec.feature.md"));
        assert!(err.to_string().contains("opening"));

        let missing = validate_frontmatter(&dir.path().join("nope.md")).unwrap_err();
        assert!(matches!(missing, SpecError::Unreadable { .. }));
    }
}
