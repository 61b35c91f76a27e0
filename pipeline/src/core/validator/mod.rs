//! Static safety gate for generated Python automation scripts.
//!
//! [`validate`] parses the program with tree-sitter and runs a fixed set of
//! independent checks over the syntax tree. When the program does not parse, a
//! line-level pattern scan backs up the tree checks so hazards inside the
//! broken region are still reported. Every check that runs is recorded in
//! [`ValidationResult::checks_performed`], whether or not it found anything.
//!
//! Error-severity issues block execution. Warnings are advisory.
//!
//! [`suggest_fix`] rewrites the program for one issue. Fixes are advisory:
//! callers re-validate the rewritten program before trusting it.

mod checks;
mod fix;
mod line_scan;
mod syntax;

use std::cmp::Reverse;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use checks::Finding;

/// Iteration cap written into loops rewritten by [`suggest_fix`].
pub const MAX_LOOP_ITERATIONS: u32 = 10_000;
/// Timeout, in seconds, written into network calls rewritten by [`suggest_fix`].
pub const FIX_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    UnboundedLoop,
    MissingTimeout,
    BlockingCall,
    UnboundedRecursion,
    SyntaxError,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::UnboundedLoop => "unbounded-loop",
            IssueType::MissingTimeout => "missing-timeout",
            IssueType::BlockingCall => "blocking-call",
            IssueType::UnboundedRecursion => "unbounded-recursion",
            IssueType::SyntaxError => "syntax-error",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the checks [`validate`] can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    Syntax,
    UnboundedLoop,
    MissingTimeout,
    BlockingCall,
    UnboundedRecursion,
    /// Line-level fallback, only run when the program does not parse.
    LineScan,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Syntax => "syntax",
            CheckKind::UnboundedLoop => "unbounded-loop",
            CheckKind::MissingTimeout => "missing-timeout",
            CheckKind::BlockingCall => "blocking-call",
            CheckKind::UnboundedRecursion => "unbounded-recursion",
            CheckKind::LineScan => "line-scan",
        }
    }
}

/// One problem found in a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub issue_type: IssueType,
    pub message: String,
    /// 1-based, best effort.
    pub line_number: Option<usize>,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn error(issue_type: IssueType, message: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            severity: Severity::Error,
            issue_type,
            message: message.into(),
            line_number: line,
            suggestion: None,
        }
    }

    pub fn warning(issue_type: IssueType, message: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(issue_type, message, line)
        }
    }

    pub fn with_suggestion(self, suggestion: impl Into<String>) -> Self {
        Self {
            suggestion: Some(suggestion.into()),
            ..self
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    fn same_site(&self, other: &ValidationIssue) -> bool {
        self.issue_type == other.issue_type && self.line_number == other.line_number
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line_number {
            write!(f, "line {line}: ")?;
        }
        write!(f, "{} ({})", self.message, self.issue_type)
    }
}

/// Outcome of one [`validate`] call. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
    checks_performed: Vec<CheckKind>,
}

impl ValidationResult {
    /// Issues in the order the checks produced them.
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn checks_performed(&self) -> &[CheckKind] {
        &self.checks_performed
    }

    pub fn performed(&self, check: CheckKind) -> bool {
        self.checks_performed.contains(&check)
    }

    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| issue.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| !issue.is_error())
    }

    pub fn has_issue(&self, issue_type: IssueType) -> bool {
        self.issues.iter().any(|issue| issue.issue_type == issue_type)
    }

    /// Deterministic one-line summary of error issues.
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Run every check against `code`.
///
/// If the Python grammar cannot be loaded the result carries a syntax error so
/// the program is blocked rather than waved through.
pub fn validate(code: &str) -> ValidationResult {
    let (findings, checks_performed) = match run_checks(code) {
        Ok(out) => out,
        Err(err) => {
            warn!(err = %err, "python parser unavailable, blocking program");
            let issue = ValidationIssue::error(
                IssueType::SyntaxError,
                format!("program could not be parsed: {err:#}"),
                None,
            );
            return ValidationResult {
                issues: vec![issue],
                checks_performed: vec![CheckKind::Syntax],
            };
        }
    };
    let issues: Vec<ValidationIssue> = findings.into_iter().map(|f| f.issue).collect();
    debug!(
        issues = issues.len(),
        checks = checks_performed.len(),
        "validated program"
    );
    ValidationResult {
        issues,
        checks_performed,
    }
}

/// Best-effort rewrite of `code` that resolves `issue`.
///
/// Returns `None` when the issue type has no safe mechanical rewrite
/// (unbounded recursion, syntax errors) or when the issue no longer matches
/// anything in `code`.
pub fn suggest_fix(code: &str, issue: &ValidationIssue) -> Option<String> {
    let (findings, _) = run_checks(code).ok()?;
    let finding = findings
        .into_iter()
        .find(|finding| finding.issue.same_site(issue) && finding.fix.is_some())?;
    let site = finding.fix?;
    debug!(issue_type = %issue.issue_type, line = ?issue.line_number, "applying fix");
    Some(fix::apply(code, &site))
}

/// Apply [`suggest_fix`] once for every error in `result`, bottom-up so the
/// line numbers of the remaining issues stay valid.
///
/// Returns `None` when no error had a fix.
pub fn suggest_fixes(code: &str, result: &ValidationResult) -> Option<String> {
    let mut issues: Vec<&ValidationIssue> = result.errors().collect();
    issues.sort_by_key(|issue| Reverse(issue.line_number));

    let mut fixed = code.to_string();
    let mut changed = false;
    for issue in issues {
        if let Some(next) = suggest_fix(&fixed, issue) {
            fixed = next;
            changed = true;
        }
    }
    changed.then_some(fixed)
}

fn run_checks(code: &str) -> anyhow::Result<(Vec<Finding>, Vec<CheckKind>)> {
    let tree = syntax::parse(code)?;
    let root = tree.root_node();

    let mut findings = Vec::new();
    let mut performed = Vec::new();

    performed.push(CheckKind::Syntax);
    findings.extend(checks::syntax_errors(root));

    performed.push(CheckKind::UnboundedLoop);
    findings.extend(checks::unbounded_loops(root, code));

    performed.push(CheckKind::MissingTimeout);
    findings.extend(checks::missing_timeouts(root, code));

    performed.push(CheckKind::BlockingCall);
    findings.extend(checks::blocking_calls(root, code));

    performed.push(CheckKind::UnboundedRecursion);
    findings.extend(checks::unbounded_recursion(root, code));

    if root.has_error() {
        performed.push(CheckKind::LineScan);
        for finding in line_scan::scan(code) {
            if !findings.iter().any(|f| f.issue.same_site(&finding.issue)) {
                findings.push(finding);
            }
        }
    }

    Ok((findings, performed))
}
