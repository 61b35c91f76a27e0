//! Line-level fallback for programs the parser could not fully recover.
//!
//! Coarser than the tree checks: patterns are matched per line, loop bodies are
//! inferred from indentation, and findings never carry a fix.

use std::sync::LazyLock;

use regex::Regex;

use super::checks::{Finding, INPUT_MESSAGE, LOOP_MESSAGE, LOOP_SUGGESTION, TIMEOUT_MESSAGE};
use super::{IssueType, ValidationIssue};

static WHILE_TRUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*while\s+\(?\s*(True|1)\s*\)?\s*:").unwrap());
static LOOP_EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(break|return|raise)\b|\bexit\s*\(").unwrap());
static INPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.])(raw_input|input|getpass)\s*\(|getpass\.getpass\s*\(|sys\.stdin\.read")
        .unwrap()
});
static SOCKET_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\w+)\.(connect|connect_ex|recv|recvfrom|recv_into|recvfrom_into|accept|sendall)\s*\(")
        .unwrap()
});
static TIMEOUT_SET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.settimeout\s*\(|\bsetdefaulttimeout\s*\(").unwrap());

const LOCAL_RECEIVERS: &[&str] = &["sqlite3", "duckdb", "signal"];

pub(crate) fn scan(code: &str) -> Vec<Finding> {
    let lines: Vec<&str> = code.lines().collect();
    let mut findings = Vec::new();
    let mut timeout_seen = false;

    for (idx, raw) in lines.iter().enumerate() {
        let line_number = Some(idx + 1);
        let trimmed = raw.trim_start();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }

        if WHILE_TRUE_RE.is_match(raw) && !body_exits(&lines, idx) {
            let issue = ValidationIssue::error(IssueType::UnboundedLoop, LOOP_MESSAGE, line_number)
                .with_suggestion(LOOP_SUGGESTION);
            findings.push(Finding { issue, fix: None });
        }

        if TIMEOUT_SET_RE.is_match(raw) {
            timeout_seen = true;
        }
        if !timeout_seen {
            let network = SOCKET_CALL_RE
                .captures(raw)
                .is_some_and(|caps| !LOCAL_RECEIVERS.contains(&&caps[1]));
            if network {
                let issue =
                    ValidationIssue::error(IssueType::MissingTimeout, TIMEOUT_MESSAGE, line_number);
                findings.push(Finding { issue, fix: None });
            }
        }

        if INPUT_RE.is_match(raw) {
            let issue = ValidationIssue::error(IssueType::BlockingCall, INPUT_MESSAGE, line_number);
            findings.push(Finding { issue, fix: None });
        }
    }
    findings
}

/// Whether the block under `header` (lines indented deeper than it) leaves the
/// loop.
fn body_exits(lines: &[&str], header: usize) -> bool {
    let indent = indent_width(lines[header]);
    lines[header + 1..]
        .iter()
        .filter(|line| !line.trim().is_empty())
        .take_while(|line| indent_width(line) > indent)
        .any(|line| !line.trim_start().starts_with('#') && LOOP_EXIT_RE.is_match(line))
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}
