//! Thin helpers over the tree-sitter Python grammar.

use anyhow::{Result, anyhow};
use tree_sitter::{Node, Parser, Tree};

/// Node kinds that open a new function scope. Exits and calls inside them do not
/// belong to the enclosing construct.
const SCOPE_KINDS: &[&str] = &["function_definition", "class_definition", "lambda"];

pub(crate) fn parse(source: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|err| anyhow!("load python grammar: {err}"))?;
    parser
        .parse(source, None)
        .ok_or_else(|| anyhow!("python parser returned no tree"))
}

/// All nodes under `node` (inclusive), in document order.
pub(crate) fn descendants(node: Node<'_>) -> Vec<Node<'_>> {
    let mut out = Vec::new();
    collect(node, &mut out, false);
    out
}

/// Like [`descendants`], but does not enter nested function, class, or lambda
/// bodies below `node`.
pub(crate) fn scope_descendants(node: Node<'_>) -> Vec<Node<'_>> {
    let mut out = Vec::new();
    collect(node, &mut out, true);
    out
}

fn collect<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>, stop_at_scopes: bool) {
    out.push(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if stop_at_scopes && is_scope(child) {
            continue;
        }
        collect(child, out, stop_at_scopes);
    }
}

pub(crate) fn is_scope(node: Node<'_>) -> bool {
    SCOPE_KINDS.contains(&node.kind())
}

pub(crate) fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// 1-based source line of the node's first byte.
pub(crate) fn line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

pub(crate) fn first_named_child(node: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).next()
}

/// Dotted name of a call's callee (`input`, `sys.stdin.read`, `s.connect`).
///
/// Whitespace is stripped so `sys . exit` and `sys.exit` compare equal.
pub(crate) fn callee(call: Node<'_>, source: &str) -> Option<String> {
    let function = call.child_by_field_name("function")?;
    Some(
        text(function, source)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect(),
    )
}

/// First line containing a parse error or a missing token, if any.
pub(crate) fn first_error_line(root: Node<'_>) -> Option<usize> {
    descendants(root)
        .into_iter()
        .find(|node| node.is_error() || node.is_missing())
        .map(line)
}

/// Nearest ancestor (or `node` itself) that is a statement: a direct child of a
/// block or of the module.
pub(crate) fn enclosing_statement(node: Node<'_>) -> Node<'_> {
    let mut current = node;
    while let Some(parent) = current.parent() {
        if matches!(parent.kind(), "block" | "module") {
            return current;
        }
        current = parent;
    }
    current
}

/// Byte offset where the line containing `byte` starts.
pub(crate) fn line_start(source: &str, byte: usize) -> usize {
    source[..byte].rfind('\n').map(|idx| idx + 1).unwrap_or(0)
}

/// Leading whitespace of the line starting at `line_start`.
pub(crate) fn indent_at(source: &str, line_start: usize) -> &str {
    let rest = &source[line_start..];
    let width = rest
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(rest.len());
    &rest[..width]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_python_without_errors() {
        let tree = parse("x = 1\nprint(x)\n").expect("parse");
        assert!(!tree.root_node().has_error());
    }

    #[test]
    fn reports_line_of_first_parse_error() {
        let source = "x = 1\ndef broken(:\n    pass\n";
        let tree = parse(source).expect("parse");
        assert!(tree.root_node().has_error());
        assert!(matches!(first_error_line(tree.root_node()), Some(2 | 3)));
    }

    #[test]
    fn scope_descendants_skip_nested_functions() {
        let source = "def outer():\n    def inner():\n        return 1\n    return 2\n";
        let tree = parse(source).expect("parse");
        let root = tree.root_node();
        let outer = descendants(root)
            .into_iter()
            .find(|node| node.kind() == "function_definition")
            .expect("outer");
        let body = outer.child_by_field_name("body").expect("body");
        let returns = scope_descendants(body)
            .into_iter()
            .filter(|node| node.kind() == "return_statement")
            .count();
        assert_eq!(returns, 1);
    }

    #[test]
    fn indent_helpers_find_line_prefix() {
        let source = "if x:\n    call()\n";
        let byte = source.find("call").expect("call");
        let start = line_start(source, byte);
        assert_eq!(indent_at(source, start), "    ");
    }
}
