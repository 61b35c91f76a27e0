//! Extract a user-stated retry limit ("give up after 3 tries") from a request.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RetryLimit {
    /// No limit was stated. Configuration still caps the attempt count.
    Unlimited,
    AtMost(u32),
}

impl RetryLimit {
    /// Effective max-retries: the stated limit, never above `backstop`.
    pub fn ceiling(self, backstop: u32) -> u32 {
        match self {
            RetryLimit::Unlimited => backstop,
            RetryLimit::AtMost(n) => n.min(backstop),
        }
    }
}

const UNIT: &str = r"(?:attempts?|tries|try|retries|retry|times)";

/// Ordered; the first pattern that matches decides.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"\bmax(?:imum)?\s+(?:of\s+)?(\d+)\s+{UNIT}"),
        r"\bgive\s+up\s+after\s+(\d+)".to_string(),
        r"\bno\s+more\s+than\s+(\d+)".to_string(),
        r"\bat\s+most\s+(\d+)".to_string(),
        format!(r"\bup\s+to\s+(\d+)\s+{UNIT}"),
        r"\bretry\s+(\d+)\s+times?".to_string(),
        r"\b(\d+)\s+(?:retries|attempts|tries)\b".to_string(),
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){pattern}")).unwrap())
    .collect()
});

pub fn parse_retry_limit(text: &str) -> RetryLimit {
    let Some(digits) = PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(text))
        .and_then(|caps| caps.get(1))
    else {
        return RetryLimit::Unlimited;
    };
    let value = digits.as_str().parse::<u32>().unwrap_or(u32::MAX);
    if value == 0 {
        RetryLimit::Unlimited
    } else {
        RetryLimit::AtMost(value)
    }
}
