//! Tree-based checks. Each returns findings in document order.

use std::collections::HashSet;
use std::ops::Range;

use tree_sitter::Node;

use super::syntax::{
    callee, descendants, enclosing_statement, first_error_line, first_named_child, indent_at,
    is_scope, line, line_start, scope_descendants, text,
};
use super::{IssueType, ValidationIssue};

pub(crate) const LOOP_MESSAGE: &str = "infinite loop will exceed the execution time budget";
pub(crate) const LOOP_SUGGESTION: &str = "bound the loop: iterate over a fixed range or break once an iteration cap or deadline is reached";
pub(crate) const TIMEOUT_MESSAGE: &str =
    "blocking network call has no timeout and may hang indefinitely";
pub(crate) const INPUT_MESSAGE: &str =
    "interactive input is not available in a non-interactive execution context and will hang";
pub(crate) const INPUT_SUGGESTION: &str =
    "take the value from a parameter, an environment variable, or a hard-coded placeholder";

/// Calls that terminate the process from inside a loop body.
const EXIT_CALLS: &[&str] = &["sys.exit", "exit", "quit", "os._exit"];

/// Socket methods that block until the peer responds.
const SOCKET_BLOCKING: &[&str] = &[
    "connect",
    "connect_ex",
    "recv",
    "recvfrom",
    "recv_into",
    "recvfrom_into",
    "accept",
    "sendall",
];

/// Receivers whose `connect` is not a network call.
const LOCAL_RECEIVERS: &[&str] = &["sqlite3", "duckdb", "signal", "dbm", "shelve"];

const HTTP_METHODS: &[&str] = &[
    "get", "post", "put", "patch", "delete", "head", "options", "request",
];

const INTERACTIVE_CALLS: &[&str] = &[
    "input",
    "raw_input",
    "getpass",
    "getpass.getpass",
    "sys.stdin.read",
    "sys.stdin.readline",
    "sys.stdin.readlines",
];

/// Ancestors that make a recursive call conditional.
const GUARD_KINDS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "else_clause",
    "conditional_expression",
    "boolean_operator",
    "for_statement",
    "while_statement",
    "match_statement",
];

/// A reported issue plus, when one exists, where a mechanical fix applies.
#[derive(Debug, Clone)]
pub(crate) struct Finding {
    pub(crate) issue: ValidationIssue,
    pub(crate) fix: Option<FixSite>,
}

impl Finding {
    fn new(issue: ValidationIssue, fix: Option<FixSite>) -> Self {
        Self { issue, fix }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FixSite {
    /// Replace a constant-true `while` header with a bounded `for` header.
    BoundLoop { header: Range<usize> },
    /// Insert `<receiver>.settimeout(..)` on its own line before a statement.
    SetTimeoutBefore {
        line_start: usize,
        indent: String,
        receiver: String,
    },
    /// Add a `timeout=` keyword before a call's closing parenthesis.
    TimeoutArgument { close_paren: usize, needs_comma: bool },
    /// Replace an interactive call with a literal.
    ReplaceCall {
        span: Range<usize>,
        literal: &'static str,
    },
}

pub(crate) fn syntax_errors(root: Node<'_>) -> Vec<Finding> {
    if !root.has_error() {
        return Vec::new();
    }
    let line = first_error_line(root);
    let issue = ValidationIssue::error(
        IssueType::SyntaxError,
        "program is not valid Python",
        line,
    )
    .with_suggestion("regenerate the program; the parser stopped at this line");
    vec![Finding::new(issue, None)]
}

pub(crate) fn unbounded_loops(root: Node<'_>, source: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for node in descendants(root) {
        if node.kind() != "while_statement" {
            continue;
        }
        let (Some(condition), Some(body)) = (
            node.child_by_field_name("condition"),
            node.child_by_field_name("body"),
        ) else {
            continue;
        };
        if !is_constant_truthy(condition, source) || has_loop_exit(body, source, false) {
            continue;
        }
        let issue = ValidationIssue::error(IssueType::UnboundedLoop, LOOP_MESSAGE, Some(line(node)))
            .with_suggestion(LOOP_SUGGESTION);
        let fix = FixSite::BoundLoop {
            header: node.start_byte()..condition.end_byte(),
        };
        findings.push(Finding::new(issue, Some(fix)));
    }
    findings
}

fn is_constant_truthy(node: Node<'_>, source: &str) -> bool {
    match node.kind() {
        "true" => true,
        "integer" | "float" => !is_zero_literal(text(node, source)),
        "string" => is_non_empty_string(node),
        "parenthesized_expression" => {
            first_named_child(node).is_some_and(|inner| is_constant_truthy(inner, source))
        }
        "not_operator" => node
            .child_by_field_name("argument")
            .is_some_and(|arg| is_constant_falsy(arg, source)),
        _ => false,
    }
}

fn is_constant_falsy(node: Node<'_>, source: &str) -> bool {
    match node.kind() {
        "false" | "none" => true,
        "integer" | "float" => is_zero_literal(text(node, source)),
        "string" => !is_non_empty_string(node) && !has_interpolation(node),
        "parenthesized_expression" => {
            first_named_child(node).is_some_and(|inner| is_constant_falsy(inner, source))
        }
        _ => false,
    }
}

fn is_zero_literal(literal: &str) -> bool {
    let cleaned: String = literal
        .chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    if let Some(digits) = ["0x", "0o", "0b"]
        .iter()
        .find_map(|prefix| cleaned.strip_prefix(prefix))
    {
        return digits.chars().all(|c| c == '0');
    }
    cleaned.parse::<f64>().is_ok_and(|value| value == 0.0)
}

fn is_non_empty_string(node: Node<'_>) -> bool {
    let mut cursor = node.walk();
    let has_content = node
        .children(&mut cursor)
        .any(|child| child.kind() == "string_content");
    has_content && !has_interpolation(node)
}

fn has_interpolation(node: Node<'_>) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .any(|child| child.kind() == "interpolation");
    found
}

/// True if `node` contains a statement that leaves the enclosing loop.
///
/// `break` only counts when it belongs to the loop being checked, not to a loop
/// nested inside it.
fn has_loop_exit(node: Node<'_>, source: &str, in_nested_loop: bool) -> bool {
    match node.kind() {
        "break_statement" => return !in_nested_loop,
        "return_statement" | "raise_statement" => return true,
        "call" => {
            if callee(node, source).is_some_and(|name| EXIT_CALLS.contains(&name.as_str())) {
                return true;
            }
        }
        _ => {}
    }
    let nested = in_nested_loop || matches!(node.kind(), "while_statement" | "for_statement");
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|child| !is_scope(*child))
        .any(|child| has_loop_exit(child, source, nested))
}

pub(crate) fn missing_timeouts(root: Node<'_>, source: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut timed_receivers: HashSet<String> = HashSet::new();
    let mut default_timeout = false;

    for call in descendants(root) {
        if call.kind() != "call" {
            continue;
        }
        let Some(function) = call.child_by_field_name("function") else {
            continue;
        };
        let name = callee(call, source).unwrap_or_default();

        if function.kind() == "attribute" {
            let object = function.child_by_field_name("object");
            let receiver = object
                .map(|obj| compact(text(obj, source)))
                .unwrap_or_default();
            // `socket.socket().settimeout(..)` configures a throwaway object.
            let named = object.is_some_and(is_named_receiver);
            let method = function
                .child_by_field_name("attribute")
                .map(|attr| text(attr, source))
                .unwrap_or_default();

            match method {
                "settimeout" if !first_argument_is_none(call, source) => {
                    if named {
                        timed_receivers.insert(receiver);
                    }
                    continue;
                }
                "setblocking" => {
                    if named && first_argument_is(call, source, &["False", "0"]) {
                        timed_receivers.insert(receiver);
                    }
                    continue;
                }
                "setdefaulttimeout" if receiver == "socket" => {
                    default_timeout = true;
                    continue;
                }
                _ => {}
            }

            if SOCKET_BLOCKING.contains(&method)
                && !default_timeout
                && !LOCAL_RECEIVERS.contains(&receiver.as_str())
                && !timed_receivers.contains(&receiver)
            {
                if !named {
                    let issue = timeout_issue(
                        call,
                        &format!("bind {receiver} to a name and call settimeout(..) on it before {method}"),
                    );
                    findings.push(Finding::new(issue, None));
                    continue;
                }
                let statement = enclosing_statement(call);
                let start = line_start(source, statement.start_byte());
                let issue = timeout_issue(call, &format!("call {receiver}.settimeout(..) before {name}"));
                let fix = FixSite::SetTimeoutBefore {
                    line_start: start,
                    indent: indent_at(source, start).to_string(),
                    receiver,
                };
                findings.push(Finding::new(issue, Some(fix)));
                continue;
            }

            if receiver == "requests" && HTTP_METHODS.contains(&method) {
                if !has_timeout_argument(call, source, None) {
                    let issue = timeout_issue(call, &format!("pass timeout=.. to {name}"));
                    findings.push(Finding::new(issue, timeout_argument_site(call, source)));
                }
                continue;
            }
        }

        let positional_slot = if name == "urlopen" || name.ends_with(".urlopen") {
            Some(3)
        } else if name == "create_connection" || name.ends_with(".create_connection") {
            Some(2)
        } else {
            None
        };
        if let Some(slot) = positional_slot {
            if has_timeout_argument(call, source, Some(slot)) {
                if let Some(bound) = bound_name(call, source) {
                    timed_receivers.insert(bound);
                }
            } else {
                let issue = timeout_issue(call, &format!("pass timeout=.. to {name}"));
                findings.push(Finding::new(issue, timeout_argument_site(call, source)));
            }
        }
    }
    findings
}

/// A plain name or attribute chain (`sock`, `self.conn`) refers to the same
/// object on every evaluation; anything else may build a new one.
fn is_named_receiver(node: Node<'_>) -> bool {
    match node.kind() {
        "identifier" => true,
        "attribute" => node
            .child_by_field_name("object")
            .is_some_and(is_named_receiver),
        _ => false,
    }
}

fn timeout_issue(call: Node<'_>, suggestion: &str) -> ValidationIssue {
    ValidationIssue::error(IssueType::MissingTimeout, TIMEOUT_MESSAGE, Some(line(call)))
        .with_suggestion(format!(
            "set an explicit timeout (e.g. {} seconds): {suggestion}",
            super::FIX_TIMEOUT_SECS
        ))
}

fn compact(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn arguments(call: Node<'_>) -> Vec<Node<'_>> {
    let Some(args) = call.child_by_field_name("arguments") else {
        return Vec::new();
    };
    let mut cursor = args.walk();
    args.named_children(&mut cursor)
        .filter(|arg| arg.kind() != "comment")
        .collect()
}

fn first_argument_is_none(call: Node<'_>, source: &str) -> bool {
    first_argument_is(call, source, &["None"])
}

fn first_argument_is(call: Node<'_>, source: &str, literals: &[&str]) -> bool {
    arguments(call)
        .first()
        .is_some_and(|arg| literals.contains(&text(*arg, source).trim()))
}

/// True if the call passes `timeout=`, unpacks `**kwargs`, or fills the
/// positional timeout slot (1-based) when one is given.
fn has_timeout_argument(call: Node<'_>, source: &str, positional_slot: Option<usize>) -> bool {
    let args = arguments(call);
    let keyword = args.iter().any(|arg| match arg.kind() {
        "keyword_argument" => arg
            .child_by_field_name("name")
            .is_some_and(|name| text(name, source) == "timeout"),
        "dictionary_splat" => true,
        _ => false,
    });
    let positional = args
        .iter()
        .filter(|arg| !matches!(arg.kind(), "keyword_argument" | "dictionary_splat"))
        .count();
    keyword || positional_slot.is_some_and(|slot| positional >= slot)
}

fn timeout_argument_site(call: Node<'_>, source: &str) -> Option<FixSite> {
    let args = call.child_by_field_name("arguments")?;
    if args.kind() != "argument_list" {
        return None;
    }
    let close_paren = args.end_byte().checked_sub(1)?;
    if source.as_bytes().get(close_paren) != Some(&b')') {
        return None;
    }
    let inner = source[args.start_byte() + 1..close_paren].trim_end();
    let needs_comma = !inner.trim().is_empty() && !inner.ends_with(',');
    Some(FixSite::TimeoutArgument {
        close_paren,
        needs_comma,
    })
}

/// Name a call's result is bound to: `x = call()` or `with call() as x`.
fn bound_name(call: Node<'_>, source: &str) -> Option<String> {
    let parent = call.parent()?;
    match parent.kind() {
        "assignment" => parent
            .child_by_field_name("left")
            .map(|left| compact(text(left, source))),
        "as_pattern" => parent
            .child_by_field_name("alias")
            .map(|alias| compact(text(alias, source))),
        _ => None,
    }
}

pub(crate) fn blocking_calls(root: Node<'_>, source: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for call in descendants(root) {
        if call.kind() != "call" {
            continue;
        }
        let Some(name) = callee(call, source) else {
            continue;
        };
        if !INTERACTIVE_CALLS.contains(&name.as_str()) {
            continue;
        }
        let issue = ValidationIssue::error(IssueType::BlockingCall, INPUT_MESSAGE, Some(line(call)))
            .with_suggestion(format!("replace {name}(): {INPUT_SUGGESTION}"));
        let fix = FixSite::ReplaceCall {
            span: call.start_byte()..call.end_byte(),
            literal: placeholder_for(call, source),
        };
        findings.push(Finding::new(issue, Some(fix)));
    }
    findings
}

/// `int(input())` needs a literal that still converts.
fn placeholder_for(call: Node<'_>, source: &str) -> &'static str {
    let numeric_wrapper = call
        .parent()
        .filter(|parent| parent.kind() == "argument_list")
        .and_then(|args| args.parent())
        .and_then(|outer| callee(outer, source))
        .is_some_and(|name| name == "int" || name == "float");
    if numeric_wrapper {
        "\"0\""
    } else {
        "\"placeholder\""
    }
}

pub(crate) fn unbounded_recursion(root: Node<'_>, source: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for function in descendants(root) {
        if function.kind() != "function_definition" {
            continue;
        }
        let (Some(name_node), Some(body)) = (
            function.child_by_field_name("name"),
            function.child_by_field_name("body"),
        ) else {
            continue;
        };
        let name = text(name_node, source);
        let scope = scope_descendants(body);

        let Some(recursive_call) = scope
            .iter()
            .copied()
            .find(|node| node.kind() == "call" && calls_itself(*node, name, source))
        else {
            continue;
        };
        if is_guarded(recursive_call, body) || has_base_case_before(&scope, recursive_call) {
            continue;
        }
        let issue = ValidationIssue::warning(
            IssueType::UnboundedRecursion,
            format!("function `{name}` calls itself with no visible base case"),
            Some(line(function)),
        )
        .with_suggestion(
            "add a conditional return before the recursive call, or rewrite the function iteratively",
        );
        findings.push(Finding::new(issue, None));
    }
    findings
}

fn calls_itself(call: Node<'_>, name: &str, source: &str) -> bool {
    let Some(function) = call.child_by_field_name("function") else {
        return false;
    };
    match function.kind() {
        "identifier" => text(function, source) == name,
        "attribute" => {
            let receiver = function
                .child_by_field_name("object")
                .map(|obj| text(obj, source));
            let attr = function
                .child_by_field_name("attribute")
                .map(|attr| text(attr, source));
            matches!(receiver, Some("self" | "cls")) && attr == Some(name)
        }
        _ => false,
    }
}

fn is_guarded(call: Node<'_>, body: Node<'_>) -> bool {
    let mut current = call.parent();
    while let Some(node) = current {
        if node == body {
            return false;
        }
        if GUARD_KINDS.contains(&node.kind()) {
            return true;
        }
        current = node.parent();
    }
    false
}

fn has_base_case_before(scope: &[Node<'_>], call: Node<'_>) -> bool {
    scope
        .iter()
        .filter(|node| node.kind() == "if_statement" && node.start_byte() < call.start_byte())
        .any(|branch| {
            scope_descendants(*branch)
                .into_iter()
                .any(|node| matches!(node.kind(), "return_statement" | "raise_statement"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_literals_are_recognised() {
        assert!(is_zero_literal("0"));
        assert!(is_zero_literal("0x0"));
        assert!(is_zero_literal("0.0"));
        assert!(is_zero_literal("0_0"));
        assert!(!is_zero_literal("1"));
        assert!(!is_zero_literal("0xff"));
        assert!(!is_zero_literal("0.5"));
    }

    #[test]
    fn constant_conditions() {
        let source = "while 'go':\n    pass\nwhile not False:\n    pass\nwhile '':\n    pass\n";
        let tree = super::super::syntax::parse(source).expect("parse");
        let findings = unbounded_loops(tree.root_node(), source);
        let lines: Vec<_> = findings.iter().map(|f| f.issue.line_number).collect();
        assert_eq!(lines, vec![Some(1), Some(3)]);
    }

    #[test]
    fn timeout_via_create_connection_covers_bound_socket() {
        let source = "\
import socket
with socket.create_connection(('h', 1), timeout=3) as conn:
    conn.recv(10)
";
        let tree = super::super::syntax::parse(source).expect("parse");
        assert!(missing_timeouts(tree.root_node(), source).is_empty());
    }

    #[test]
    fn urlopen_positional_timeout_counts() {
        let source = "from urllib.request import urlopen\nurlopen('http://x', None, 5)\nurlopen('http://x')\n";
        let tree = super::super::syntax::parse(source).expect("parse");
        let findings = missing_timeouts(tree.root_node(), source);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].issue.line_number, Some(3));
    }

    #[test]
    fn temporary_receivers_are_flagged_without_a_fix() {
        let source = "\
import socket
socket.socket().settimeout(5)
socket.socket().connect(('example.com', 80))
";
        let tree = super::super::syntax::parse(source).expect("parse");
        let findings = missing_timeouts(tree.root_node(), source);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].issue.line_number, Some(3));
        assert!(findings[0].fix.is_none());
    }

    #[test]
    fn attribute_receivers_keep_their_timeout() {
        let source = "self.conn.settimeout(5)\nself.conn.recv(10)\n";
        let tree = super::super::syntax::parse(source).expect("parse");
        assert!(missing_timeouts(tree.root_node(), source).is_empty());
    }

    #[test]
    fn method_recursion_through_self_is_detected() {
        let source = "class Walker:\n    def step(self):\n        self.step()\n";
        let tree = super::super::syntax::parse(source).expect("parse");
        let findings = unbounded_recursion(tree.root_node(), source);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].issue.line_number, Some(2));
    }
}
