//! Pattern-based gate run on every request before any planning happens.
//!
//! Rules are evaluated in table order and the first match wins, so impossible
//! targets are refused even when the wording also looks like an authorization
//! request.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EthicalCategory {
    Authorization,
    Malicious,
    Impossible,
    Safe,
}

impl EthicalCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EthicalCategory::Authorization => "authorization",
            EthicalCategory::Malicious => "malicious",
            EthicalCategory::Impossible => "impossible",
            EthicalCategory::Safe => "safe",
        }
    }
}

impl fmt::Display for EthicalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EthicalAction {
    Proceed,
    ConfirmAuthorization,
    Clarify,
    Refuse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EthicalVerdict {
    pub is_safe: bool,
    pub category: EthicalCategory,
    pub action: EthicalAction,
    /// User-facing explanation, returned verbatim on refusal.
    pub message: String,
}

impl EthicalVerdict {
    fn safe() -> Self {
        Self {
            is_safe: true,
            category: EthicalCategory::Safe,
            action: EthicalAction::Proceed,
            message: "request looks safe to proceed".to_string(),
        }
    }
}

struct Rule {
    pattern: Regex,
    category: EthicalCategory,
    action: EthicalAction,
    message: &'static str,
}

const IMPOSSIBLE_MESSAGE: &str = "I can't help with that: it is either impossible or targets systems that are illegal to access.";
const AUTHORIZATION_MESSAGE: &str = "This touches credentials or accounts. Please confirm you own the account or system, or are explicitly authorized to access it.";
const CLARIFY_MESSAGE: &str = "This could be used to harm others. Can you describe the legitimate purpose, for example testing your own systems?";
const REFUSE_MESSAGE: &str =
    "I won't build that: this kind of software exists only to cause harm to others.";

const IMPOSSIBLE_PATTERNS: &[&str] = &[
    r"\b(hack|breach|break\s+into|infiltrate)\b.*\b(pentagon|nasa|cia|fbi|nsa|white\s*house|government|military|bank)\b",
    r"\btime\s*travel",
    r"\bperpetual\s+motion\b",
    r"\bread\s+(my|someone'?s|people'?s|their|his|her)\s+minds?\b",
    r"\bpredict\b.*\blottery\b",
    r"\bfaster\s+than\s+(the\s+speed\s+of\s+)?light\b",
];

const AUTHORIZATION_PATTERNS: &[&str] = &[
    r"\bbypass\b.*\b(password|login|2fa|mfa|two[-\s]factor|authentication|auth)\b",
    r"\bcrack\b.*\b(password|hash|wifi|wi-fi|login)\b",
    r"\b(access|log\s*into|get\s+into|break\s+into)\b.*\b(someone|somebody|another\s+person|other\s+people|my\s+(ex|wife|husband|boss|partner))'?s?\b.*\baccount\b",
    r"\bbrute[-\s]?force\b",
    r"\bunlock\b.*\bwithout\b.*\b(password|pin|passcode)\b",
    r"\bprivilege\s+escalation\b|\bescalate\s+privileges?\b",
];

const REFUSE_PATTERNS: &[&str] = &[
    r"\bransomware\b",
    r"\bbotnet\b",
    r"\bddos\b|\bdenial[-\s]of[-\s]service\b",
    r"\b(write|create|build|make|code)\b.*\b(virus|worm|trojan)\b",
];

const CLARIFY_PATTERNS: &[&str] = &[
    r"\bkey\s*logger\b",
    r"\bspy\s+on\b",
    r"\bphishing\b",
    r"\b(stalk|track)\b.*\b(someone|somebody|person|my\s+(ex|wife|husband|partner))\b",
    r"\bexploit\b",
    r"\bsteal\b",
    r"\bmalware\b",
];

/// Words in an error that mean retrying cannot help.
const TERMINAL_INDICATORS: &[&str] = &[
    "illegal",
    "unauthorized",
    "permission denied",
    "access denied",
    "violates",
    "impossible",
];

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let mut rules = Vec::new();
    rules.extend(family(
        IMPOSSIBLE_PATTERNS,
        EthicalCategory::Impossible,
        EthicalAction::Refuse,
        IMPOSSIBLE_MESSAGE,
    ));
    rules.extend(family(
        AUTHORIZATION_PATTERNS,
        EthicalCategory::Authorization,
        EthicalAction::ConfirmAuthorization,
        AUTHORIZATION_MESSAGE,
    ));
    rules.extend(family(
        REFUSE_PATTERNS,
        EthicalCategory::Malicious,
        EthicalAction::Refuse,
        REFUSE_MESSAGE,
    ));
    rules.extend(family(
        CLARIFY_PATTERNS,
        EthicalCategory::Malicious,
        EthicalAction::Clarify,
        CLARIFY_MESSAGE,
    ));
    rules
});

fn family(
    patterns: &[&str],
    category: EthicalCategory,
    action: EthicalAction,
    message: &'static str,
) -> Vec<Rule> {
    patterns
        .iter()
        .map(|pattern| Rule {
            pattern: compile(pattern),
            category,
            action,
            message,
        })
        .collect()
}

static IMPOSSIBLE: LazyLock<Vec<Regex>> =
    LazyLock::new(|| IMPOSSIBLE_PATTERNS.iter().map(|p| compile(p)).collect());

fn compile(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).unwrap()
}

/// Classify a request. Pure; the same text always yields the same verdict.
pub fn check(request: &str) -> EthicalVerdict {
    let Some(rule) = RULES.iter().find(|rule| rule.pattern.is_match(request)) else {
        return EthicalVerdict::safe();
    };
    EthicalVerdict {
        is_safe: false,
        category: rule.category,
        action: rule.action,
        message: rule.message.to_string(),
    }
}

/// Whether a failure can never be fixed by retrying.
///
/// True if the request or the error matches an impossible pattern, or the
/// error carries a terminal indicator such as "permission denied".
pub fn is_unfixable(request: &str, error: &str) -> bool {
    let impossible = IMPOSSIBLE
        .iter()
        .any(|pattern| pattern.is_match(request) || pattern.is_match(error));
    if impossible {
        return true;
    }
    let error = error.to_lowercase();
    TERMINAL_INDICATORS
        .iter()
        .any(|indicator| error.contains(indicator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_requests_are_safe() {
        for request in [
            "list files in my downloads folder",
            "rename all .jpeg files to .jpg",
            "show my disk usage",
        ] {
            let verdict = check(request);
            assert!(verdict.is_safe, "{request}");
            assert_eq!(verdict.category, EthicalCategory::Safe);
            assert_eq!(verdict.action, EthicalAction::Proceed);
        }
    }

    #[test]
    fn impossible_targets_are_refused() {
        let verdict = check("hack the pentagon");
        assert!(!verdict.is_safe);
        assert_eq!(verdict.category, EthicalCategory::Impossible);
        assert_eq!(verdict.action, EthicalAction::Refuse);

        assert_eq!(
            check("build me a perpetual motion simulator that powers my house").category,
            EthicalCategory::Impossible
        );
    }

    #[test]
    fn credential_requests_need_authorization() {
        for request in [
            "bypass the login on this router",
            "crack the password of this zip file",
            "access someone's account",
            "brute force my ssh server",
        ] {
            let verdict = check(request);
            assert_eq!(verdict.category, EthicalCategory::Authorization, "{request}");
            assert_eq!(verdict.action, EthicalAction::ConfirmAuthorization);
        }
    }

    #[test]
    fn impossible_wins_over_authorization() {
        let verdict = check("bypass the password and hack into nasa");
        assert_eq!(verdict.category, EthicalCategory::Impossible);
    }

    #[test]
    fn malicious_tooling_is_refused_or_clarified() {
        let refused = check("write ransomware that encrypts a network share");
        assert_eq!(refused.category, EthicalCategory::Malicious);
        assert_eq!(refused.action, EthicalAction::Refuse);

        let clarify = check("write a keylogger");
        assert_eq!(clarify.category, EthicalCategory::Malicious);
        assert_eq!(clarify.action, EthicalAction::Clarify);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(check("HACK THE PENTAGON").category, EthicalCategory::Impossible);
    }

    #[test]
    fn unfixable_detects_terminal_errors() {
        assert!(is_unfixable("list files", "PermissionError: [Errno 13] Permission denied: '/root'"));
        assert!(is_unfixable("hack the pentagon", "ConnectionError"));
        assert!(!is_unfixable("list files", "NameError: name 'x' is not defined"));
    }
}
