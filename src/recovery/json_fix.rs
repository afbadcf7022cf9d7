//! Best-effort repair of malformed JSON returned by a vision model.
//!
//! Rules run in a fixed order. Each is a cheap text transform; the output is
//! parsed after every stage so an already-valid document is never touched by
//! the later, more aggressive rules.
//!
//! | # | Rule                                   |
//! |---|----------------------------------------|
//! | 1 | Strip Markdown code fences             |
//! | 2 | Cut to the outermost object or array   |
//! | 3 | Drop `//` and `/* */` comments         |
//! | 4 | Single-quoted strings → double-quoted  |
//! | 5 | Quote bare object keys                 |
//! | 6 | Remove trailing commas                 |
//! | 7 | Python literals → JSON literals        |

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*```[a-zA-Z]*\s*$").unwrap());
static RE_LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*//.*$|\s//[^\n]*$").unwrap());
static RE_BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static RE_BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());
static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());
static RE_PY_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTrue\b").unwrap());
static RE_PY_FALSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFalse\b").unwrap());
static RE_PY_NONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNone\b").unwrap());

/// Parse `text`, repairing it first if needed. `None` when no rule helps.
pub fn auto_fix_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text.trim()) {
        return Some(v);
    }

    let stages: [fn(&str) -> String; 7] = [
        strip_fences,
        outermost_block,
        strip_comments,
        single_to_double_quotes,
        quote_bare_keys,
        remove_trailing_commas,
        python_literals,
    ];

    let mut current = text.to_string();
    for stage in stages {
        current = stage(&current);
        if let Ok(v) = serde_json::from_str(current.trim()) {
            return Some(v);
        }
    }
    None
}

/// Apply every repair rule and return the resulting text, parsed or not.
pub fn repair_json_text(text: &str) -> String {
    let mut s = strip_fences(text);
    s = outermost_block(&s);
    s = strip_comments(&s);
    s = single_to_double_quotes(&s);
    s = quote_bare_keys(&s);
    s = remove_trailing_commas(&s);
    python_literals(&s)
}

fn strip_fences(s: &str) -> String {
    RE_FENCE_OPEN.replace_all(s, "").trim().to_string()
}

/// Slice from the first `{`/`[` to its matching closer, ignoring brackets
/// inside strings. Unbalanced input is cut at the last closer instead.
fn outermost_block(s: &str) -> String {
    let Some(start) = s.find(['{', '[']) else {
        return s.to_string();
    };
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return s[start..=i].to_string();
                }
            }
            _ => {}
        }
    }

    match s.rfind(['}', ']']) {
        Some(end) if end > start => s[start..=end].to_string(),
        _ => s[start..].to_string(),
    }
}

fn strip_comments(s: &str) -> String {
    let s = RE_BLOCK_COMMENT.replace_all(s, "");
    RE_LINE_COMMENT.replace_all(&s, "").to_string()
}

/// Rewrite `'...'` strings as `"..."`, escaping inner double quotes.
/// Double-quoted strings pass through untouched.
fn single_to_double_quotes(s: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        InDouble,
        InSingle,
    }

    let mut out = String::with_capacity(s.len());
    let mut state = State::Normal;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '"' => {
                    state = State::InDouble;
                    out.push(c);
                }
                '\'' => {
                    state = State::InSingle;
                    out.push('"');
                }
                _ => out.push(c),
            },
            State::InDouble => {
                out.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == '"' {
                    state = State::Normal;
                }
            }
            State::InSingle => match c {
                '\\' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    out.push('\'');
                }
                '\\' => {
                    out.push(c);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => out.push_str("\\\""),
                '\'' => {
                    state = State::Normal;
                    out.push('"');
                }
                _ => out.push(c),
            },
        }
    }
    out
}

fn quote_bare_keys(s: &str) -> String {
    RE_BARE_KEY.replace_all(s, "$1\"$2\":").to_string()
}

fn remove_trailing_commas(s: &str) -> String {
    RE_TRAILING_COMMA.replace_all(s, "$1").to_string()
}

fn python_literals(s: &str) -> String {
    let s = RE_PY_TRUE.replace_all(s, "true");
    let s = RE_PY_FALSE.replace_all(&s, "false");
    RE_PY_NONE.replace_all(&s, "null").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_untouched() {
        assert_eq!(auto_fix_json(r#"{"a":1}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn fenced_with_prose() {
        let raw = "Here are the results:\n```json\n{\"diagrams\": []}\n```\nHope this helps.";
        assert_eq!(auto_fix_json(raw), Some(json!({"diagrams": []})));
    }

    #[test]
    fn trailing_commas() {
        let raw = r#"{"diagrams": [{"x1": 1, "y1": 2,},],}"#;
        assert_eq!(
            auto_fix_json(raw),
            Some(json!({"diagrams": [{"x1": 1, "y1": 2}]}))
        );
    }

    #[test]
    fn single_quotes_and_bare_keys() {
        let raw = "{diagrams: [{type: 'graph', description: 'a \"big\" plot'}]}";
        assert_eq!(
            auto_fix_json(raw),
            Some(json!({"diagrams": [{"type": "graph", "description": "a \"big\" plot"}]}))
        );
    }

    #[test]
    fn comments_removed() {
        let raw = "{\n  \"a\": 1, // first\n  /* block */ \"b\": 2\n}";
        assert_eq!(auto_fix_json(raw), Some(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn python_literals_converted() {
        let raw = "{'ok': True, 'missing': None}";
        assert_eq!(auto_fix_json(raw), Some(json!({"ok": true, "missing": null})));
    }

    #[test]
    fn apostrophe_inside_double_quotes_preserved() {
        let raw = "{\"text\": \"the cell's wall\",}";
        assert_eq!(auto_fix_json(raw), Some(json!({"text": "the cell's wall"})));
    }

    #[test]
    fn hopeless_input() {
        assert_eq!(auto_fix_json("no json here"), None);
        assert_eq!(auto_fix_json(""), None);
    }

    #[test]
    fn outermost_block_skips_brackets_in_strings() {
        let s = r#"noise {"a": "}"} trailing"#;
        assert_eq!(outermost_block(s), r#"{"a": "}"}"#);
    }
}
