//! Classification of agent output into transient and fatal failure classes.
//!
//! The agent CLI has no structured error channel, so detection is a
//! case-insensitive keyword match over the captured output.

/// Decides whether agent output indicates a rate limit or exhausted credit.
pub trait OutputClassifier: Send + Sync {
    fn is_rate_limited(&self, output: &str) -> bool;
    fn is_credit_exhausted(&self, output: &str) -> bool;
}

/// Keyword-based classifier.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rate_limit: Vec<String>,
    credit: Vec<String>,
}

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "rate-limit",
    "ratelimit",
    "overloaded",
    "too many requests",
    "capacity",
];

const CREDIT_KEYWORDS: &[&str] = &[
    "credit",
    "billing",
    "insufficient_quota",
    "quota exceeded",
    "402 payment",
    "payment required",
];

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            rate_limit: RATE_LIMIT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            credit: CREDIT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add extra credit-exhaustion keywords (matched case-insensitively).
    pub fn with_credit_keywords<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.credit
            .extend(extra.into_iter().map(|s| s.as_ref().to_lowercase()));
        self
    }

    fn matches_any(haystack: &str, needles: &[String]) -> bool {
        let lower = haystack.to_lowercase();
        needles.iter().any(|n| lower.contains(n.as_str()))
    }
}

impl OutputClassifier for KeywordClassifier {
    fn is_rate_limited(&self, output: &str) -> bool {
        Self::matches_any(output, &self.rate_limit)
    }

    fn is_credit_exhausted(&self, output: &str) -> bool {
        Self::matches_any(output, &self.credit)
    }
}
