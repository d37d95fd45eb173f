//
// boundaries.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use serde::Serialize;

/// Outcome of delimiting the next sentence of a proof script.
///
/// Invariants:
/// - `Complete.length` counts bytes from the start of the input up to and
///   including the terminator.
/// - The scanner is stateless and never looks past its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseOutcome {
    Complete { length: usize },
    Incomplete,
    Whitespace,
}

/// Byte length of the leading whitespace and comments of `text`. An
/// unterminated trailing comment is consumed to end of input.
pub fn skip_trivia(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut at = 0;

    loop {
        while at < bytes.len() && bytes[at].is_ascii_whitespace() {
            at += 1;
        }
        if starts_comment(bytes, at) {
            match scan_comment(bytes, at) {
                Some(end) => at = end,
                None => return bytes.len(),
            }
        } else {
            return at;
        }
    }
}

/// Whether `text` consists of whitespace and comments only. Used to decide
/// edit passivity.
pub fn is_trivia(text: &str) -> bool {
    skip_trivia(text) == text.len()
}

/// Delimit the next sentence of `text`, the suffix starting at the sentence
/// origin.
///
/// Terminators:
/// - `.` or `...` followed by whitespace or end of input, outside comments,
///   string literals, backquote notations, and `[`-bracketed groups.
/// - A bullet (a run of one of `-`, `+`, `*`) or a single `{` / `}` at the
///   start of the sentence is a sentence of its own.
pub fn parse_sentence(text: &str) -> ParseOutcome {
    let bytes = text.as_bytes();

    let mut at = skip_trivia(text);
    if at >= bytes.len() {
        return ParseOutcome::Whitespace;
    }

    match bytes[at] {
        b'{' | b'}' => {
            return ParseOutcome::Complete { length: at + 1 };
        },
        bullet @ (b'-' | b'+' | b'*') => {
            while at < bytes.len() && bytes[at] == bullet {
                at += 1;
            }
            return ParseOutcome::Complete { length: at };
        },
        _ => {},
    }

    let mut brackets = 0usize;

    while at < bytes.len() {
        match bytes[at] {
            b'(' if starts_comment(bytes, at) => match scan_comment(bytes, at) {
                Some(end) => at = end,
                None => return ParseOutcome::Incomplete,
            },

            b'"' => match scan_string(bytes, at) {
                Some(end) => at = end,
                None => return ParseOutcome::Incomplete,
            },

            b'`' => match scan_backquote(bytes, at) {
                Some(end) => at = end,
                None => return ParseOutcome::Incomplete,
            },

            b'[' => {
                brackets += 1;
                at += 1;
            },

            b']' => {
                brackets = brackets.saturating_sub(1);
                at += 1;
            },

            b'.' if brackets == 0 => {
                // An ellipsis terminates as a unit; a lone dot terminates
                // unless it is glued to what follows (qualified names,
                // notations)
                if bytes[at..].starts_with(b"...") && ends_token(bytes, at + 3) {
                    return ParseOutcome::Complete { length: at + 3 };
                }
                if ends_token(bytes, at + 1) {
                    return ParseOutcome::Complete { length: at + 1 };
                }
                at += 1;
            },

            _ => at += 1,
        }
    }

    ParseOutcome::Incomplete
}

fn ends_token(bytes: &[u8], at: usize) -> bool {
    at >= bytes.len() || bytes[at].is_ascii_whitespace()
}

fn starts_comment(bytes: &[u8], at: usize) -> bool {
    bytes[at..].starts_with(b"(*")
}

/// Scan a `(* … *)` comment starting at `at`. Comments nest; string literals
/// inside them are opaque, so a `*)` inside a quoted string does not close
/// the comment. Returns the offset one past the closing `*)`, or `None` when
/// the comment is unterminated.
fn scan_comment(bytes: &[u8], at: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut at = at + 2;

    while at < bytes.len() {
        if bytes[at..].starts_with(b"(*") {
            depth += 1;
            at += 2;
        } else if bytes[at..].starts_with(b"*)") {
            depth -= 1;
            at += 2;
            if depth == 0 {
                return Some(at);
            }
        } else if bytes[at] == b'"' {
            at = scan_string(bytes, at)?;
        } else {
            at += 1;
        }
    }

    None
}

/// Scan a string literal starting at the opening quote; `""` escapes a quote.
fn scan_string(bytes: &[u8], at: usize) -> Option<usize> {
    let mut at = at + 1;

    while at < bytes.len() {
        if bytes[at] == b'"' {
            if bytes[at + 1..].starts_with(b"\"") {
                at += 2;
            } else {
                return Some(at + 1);
            }
        } else {
            at += 1;
        }
    }

    None
}

fn scan_backquote(bytes: &[u8], at: usize) -> Option<usize> {
    let mut at = at + 1;

    while at < bytes.len() {
        if bytes[at] == b'`' {
            return Some(at + 1);
        }
        at += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(length: usize) -> ParseOutcome {
        ParseOutcome::Complete { length }
    }

    #[test]
    fn test_simple_sentences() {
        assert_eq!(parse_sentence("A."), complete(2));
        assert_eq!(parse_sentence("A. B."), complete(2));
        assert_eq!(parse_sentence("intros; simpl.\nauto."), complete(14));
    }

    #[test]
    fn test_dots_in_qualified_names_do_not_terminate() {
        assert_eq!(parse_sentence("apply List.map_app."), complete(19));
        assert_eq!(parse_sentence("Require Import Coq.Lists.List."), complete(30));
    }

    #[test]
    fn test_ellipsis_terminates_as_a_unit() {
        assert_eq!(parse_sentence("tactic ..."), complete(10));
        assert_eq!(parse_sentence("tactic ... more."), complete(10));
    }

    #[test]
    fn test_comments_are_opaque() {
        assert_eq!(parse_sentence("auto (* a. b. *). rest"), complete(17));
        assert_eq!(parse_sentence("auto (* nested (* x. *) y. *)."), complete(30));
        // A string inside a comment hides a closing marker
        assert_eq!(parse_sentence(r#"auto (* "*)" still comment *)."#), complete(30));
    }

    #[test]
    fn test_strings_are_opaque() {
        assert_eq!(parse_sentence(r#"Fail "a. b". next."#), complete(12));
        // Doubled quotes escape
        assert_eq!(parse_sentence(r#"Check "a""b. c"."#), complete(16));
    }

    #[test]
    fn test_bracketed_groups_swallow_dots() {
        assert_eq!(parse_sentence("rewrite [a . b] lemma."), complete(22));
    }

    #[test]
    fn test_bullets_and_braces_are_sentences() {
        assert_eq!(parse_sentence("- auto."), complete(1));
        assert_eq!(parse_sentence("-- auto."), complete(2));
        assert_eq!(parse_sentence("** auto."), complete(2));
        assert_eq!(parse_sentence("{ auto. }"), complete(1));
        assert_eq!(parse_sentence("} auto."), complete(1));
    }

    #[test]
    fn test_leading_trivia_is_included_in_length() {
        assert_eq!(parse_sentence("  A."), complete(4));
        assert_eq!(parse_sentence("(* c *) A."), complete(10));
    }

    #[test]
    fn test_incomplete_inputs() {
        assert_eq!(parse_sentence("A"), ParseOutcome::Incomplete);
        assert_eq!(parse_sentence("apply foo"), ParseOutcome::Incomplete);
        assert_eq!(parse_sentence(r#"Check "unterminated"#), ParseOutcome::Incomplete);
        assert_eq!(parse_sentence("auto (* unterminated."), ParseOutcome::Incomplete);
    }

    #[test]
    fn test_trailing_dot_without_whitespace_terminates() {
        // End of input counts as a boundary
        assert_eq!(parse_sentence("auto."), complete(5));
    }

    #[test]
    fn test_whitespace_and_comment_only_input() {
        assert_eq!(parse_sentence(""), ParseOutcome::Whitespace);
        assert_eq!(parse_sentence("  \n\t"), ParseOutcome::Whitespace);
        assert_eq!(parse_sentence(" (* only a comment *) "), ParseOutcome::Whitespace);
        // Unterminated trailing comment has no sentence to offer
        assert_eq!(parse_sentence(" (* open"), ParseOutcome::Whitespace);
    }

    #[test]
    fn test_skip_trivia() {
        assert_eq!(skip_trivia("  A."), 2);
        assert_eq!(skip_trivia("(* c *)A."), 7);
        assert_eq!(skip_trivia(" (* a *) (* b *) x"), 17);
        assert_eq!(skip_trivia("A."), 0);
    }

    #[test]
    fn test_is_trivia() {
        assert!(is_trivia(""));
        assert!(is_trivia("(*x*)"));
        assert!(is_trivia(" \n(* a (* b *) *)\t"));
        assert!(!is_trivia("(*x*) auto"));
        assert!(!is_trivia("D."));
    }
}
