//! Context-budget aware document loading for agent prompts.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default context budget in tokens.
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 100_000;

static HEADING_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#+\s").unwrap());

static SCENARIO_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(Feature|Scenario|Given|When|Then|And|But|Background|Rule)[:\s]").unwrap()
});

/// Rough token estimate for `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Read `path` for inlining into a prompt.
///
/// Content estimated above half of `max_tokens` is reduced to its
/// front-matter, headings, bold lines and scenario keyword lines. A missing
/// or empty file yields an empty string.
pub fn truncate_for_context(path: &Path, max_tokens: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    truncate_text(&content, max_tokens, &path.display().to_string())
}

/// Same as [`truncate_for_context`] but for in-memory text.
pub fn truncate_text(content: &str, max_tokens: usize, label: &str) -> String {
    if content.is_empty() {
        return String::new();
    }

    let estimated = estimate_tokens(content);
    if estimated <= max_tokens / 2 {
        return content.to_string();
    }

    warn!(
        file = label,
        estimated_tokens = estimated,
        budget = max_tokens,
        "Document exceeds half the context budget, keeping scenarios and structure only"
    );

    let mut kept: Vec<&str> = Vec::new();
    let mut fences = 0usize;
    let mut in_frontmatter = false;

    for line in content.lines() {
        if line.trim_end() == "---" {
            fences += 1;
            if fences <= 2 {
                kept.push(line);
                in_frontmatter = fences == 1;
            }
            continue;
        }
        if in_frontmatter
            || HEADING_REGEX.is_match(line)
            || SCENARIO_REGEX.is_match(line)
            || line.starts_with("**")
        {
            kept.push(line);
        }
    }

    kept.join("\n")
}

/// Keep only the last `max_chars` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}
