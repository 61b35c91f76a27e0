//! Mechanical rewrites for findings that carry a [`FixSite`].

use super::checks::FixSite;
use super::{FIX_TIMEOUT_SECS, MAX_LOOP_ITERATIONS};

pub(crate) fn apply(code: &str, site: &FixSite) -> String {
    match site {
        FixSite::BoundLoop { header } => splice(
            code,
            header.start,
            header.end,
            &format!("for _loop_guard in range({MAX_LOOP_ITERATIONS})"),
        ),
        FixSite::SetTimeoutBefore {
            line_start,
            indent,
            receiver,
        } => splice(
            code,
            *line_start,
            *line_start,
            &format!("{indent}{receiver}.settimeout({FIX_TIMEOUT_SECS})\n"),
        ),
        FixSite::TimeoutArgument {
            close_paren,
            needs_comma,
        } => {
            let separator = if *needs_comma { ", " } else { "" };
            splice(
                code,
                *close_paren,
                *close_paren,
                &format!("{separator}timeout={FIX_TIMEOUT_SECS}"),
            )
        }
        FixSite::ReplaceCall { span, literal } => splice(code, span.start, span.end, literal),
    }
}

fn splice(code: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut out = String::with_capacity(code.len() + replacement.len());
    out.push_str(&code[..start]);
    out.push_str(replacement);
    out.push_str(&code[end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_call_splices_the_span() {
        let code = "x = input()\n";
        let site = FixSite::ReplaceCall {
            span: 4..11,
            literal: "\"placeholder\"",
        };
        assert_eq!(apply(code, &site), "x = \"placeholder\"\n");
    }

    #[test]
    fn timeout_argument_respects_trailing_comma() {
        let code = "f(a,)\n";
        let site = FixSite::TimeoutArgument {
            close_paren: 4,
            needs_comma: false,
        };
        assert_eq!(apply(code, &site), "f(a,timeout=10)\n");
    }
}
