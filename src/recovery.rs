//! JSON recovery for LLM responses
//!
//! Models are asked for a single JSON object and frequently return something
//! close to it: fenced, prefixed with prose, truncated, typographically
//! "improved", or missing a comma. [`recover_json`] walks a cascade of
//! extraction and repair strategies and returns the first candidate that
//! parses to an object.

use crate::error::{NebulaError, Result};
use crate::util::truncate;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write as _;
use tracing::debug;

const ERROR_PREVIEW_CHARS: usize = 200;

/// Recover a JSON object from raw LLM text.
pub fn recover_json(raw: &str) -> Result<Value> {
    let mut session = Session::default();

    // Well-formed input comes back untouched.
    if let Some(value) = session.try_parse(raw.trim()) {
        return Ok(value);
    }

    let unfenced = strip_markdown_fences(raw).unwrap_or(raw);
    let sliced = slice_to_object(unfenced);
    if let Some(value) = session.try_parse(sliced) {
        return Ok(value);
    }

    let candidate = normalize_typography(sliced);
    if let Some(value) = session.cascade(&candidate) {
        return Ok(value);
    }

    if let Some(value) = session.cascade(raw) {
        return Ok(value);
    }
    if let Some(value) = session.cascade(&balance_brackets(raw)) {
        return Ok(value);
    }

    let mut spans = object_spans_with_actions(raw);
    spans.sort_by_key(|span| std::cmp::Reverse(span.len()));
    for span in spans {
        if let Some(value) = session.cascade(span) {
            return Ok(value);
        }
        if let Some(value) = session.cascade(&normalize_typography(span)) {
            return Ok(value);
        }
    }

    debug!(attempts = session.tried.len(), "json recovery exhausted");
    Err(NebulaError::JsonRecovery {
        response_len: raw.chars().count(),
        snippet: truncate(raw.trim(), ERROR_PREVIEW_CHARS),
    })
}

#[derive(Default)]
struct Session {
    tried: HashSet<String>,
}

impl Session {
    fn try_parse(&mut self, candidate: &str) -> Option<Value> {
        let candidate = candidate.trim();
        if candidate.is_empty() || !self.tried.insert(candidate.to_string()) {
            return None;
        }
        match serde_json::from_str::<Value>(candidate) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        }
    }

    /// Plain, balanced, repaired, and both orders of repaired+balanced.
    fn cascade(&mut self, candidate: &str) -> Option<Value> {
        let balanced = balance_brackets(candidate);
        let repaired = repair_syntax(candidate);
        let attempts = [
            candidate.to_string(),
            balanced.clone(),
            repaired.clone(),
            balance_brackets(&repaired),
            repair_syntax(&balanced),
        ];
        attempts.iter().find_map(|attempt| self.try_parse(attempt))
    }
}

/// Strip markdown code fences when the whole response is one fenced block.
pub(crate) fn strip_markdown_fences(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.len() < 6 || !trimmed.starts_with("```") || !trimmed.ends_with("```") {
        return None;
    }
    let inner = &trimmed[3..trimmed.len() - 3];
    // Drop the info string (```json) on the opening line.
    let inner = match inner.find('\n') {
        Some(newline) if !inner[..newline].contains('{') => &inner[newline + 1..],
        _ => inner,
    };
    Some(inner.trim())
}

/// Slice from the first `{` to the last `}` when the text does not already
/// start with an object. A missing closer keeps everything to the end so the
/// balancer can finish it.
fn slice_to_object(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return trimmed;
    }
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    match trimmed.rfind('}') {
        Some(end) if end > start => &trimmed[start..=end],
        _ => &trimmed[start..],
    }
}

/// Replace typographic artifacts and invisible characters.
pub fn normalize_typography(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => out.push('\''),
            '\u{2013}' | '\u{2014}' | '\u{2015}' | '\u{2212}' => out.push('-'),
            '\u{00A0}' | '\u{202F}' | '\u{2007}' => out.push(' '),
            '\t' => out.push_str("  "),
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => {}
            '\n' => out.push('\n'),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

fn trim_trailing_comma(out: &mut String) {
    let kept = out.trim_end().len();
    out.truncate(kept);
    if out.ends_with(',') {
        out.pop();
        let kept = out.trim_end().len();
        out.truncate(kept);
    }
}

/// Close whatever the text left open.
///
/// Scans outside string literals with a stack of expected closers. A closer
/// that skips over open containers closes them first; a closer with no
/// matching opener is dropped; an unterminated string is closed; remaining
/// closers are appended innermost first.
pub fn balance_brackets(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                    out.push(ch);
                } else if stack.contains(&ch) {
                    while let Some(expected) = stack.pop() {
                        trim_trailing_comma(&mut out);
                        out.push(expected);
                        if expected == ch {
                            break;
                        }
                    }
                }
            }
            _ => out.push(ch),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        trim_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

/// Fix local syntax damage outside of bracket structure: missing commas,
/// trailing commas, unquoted keys, single-quoted strings, raw control
/// characters and stray quotes inside strings, invalid escapes, comments,
/// and Python-style literals.
pub fn repair_syntax(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut after_value = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '"' | '\'' => {
                if after_value {
                    out.push(',');
                }
                i = copy_string(&chars, i, &mut out);
                after_value = true;
            }
            '{' | '[' => {
                if after_value {
                    out.push(',');
                }
                out.push(ch);
                after_value = false;
                i += 1;
            }
            '}' | ']' => {
                trim_trailing_comma(&mut out);
                out.push(ch);
                after_value = true;
                i += 1;
            }
            ',' => {
                trim_trailing_comma(&mut out);
                out.push(',');
                after_value = false;
                i += 1;
            }
            ':' => {
                out.push(':');
                after_value = false;
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && is_token_char(chars[i]) {
                    i += 1;
                }
                if i == start {
                    out.push(ch);
                    i += 1;
                    continue;
                }
                let token: String = chars[start..i].iter().collect();
                if after_value {
                    out.push(',');
                }
                let is_key = next_non_ws(&chars, i) == Some(':');
                if is_key && token.parse::<f64>().is_err() {
                    out.push('"');
                    out.push_str(&token);
                    out.push('"');
                } else {
                    out.push_str(match token.as_str() {
                        "True" => "true",
                        "False" => "false",
                        "None" | "undefined" | "NaN" => "null",
                        other => other,
                    });
                }
                after_value = true;
            }
        }
    }
    out
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '+' | '.' | '$')
}

fn next_non_ws(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

/// A quote ends the string when what follows is structural, when the next
/// token starts on a later line, or when a `"key":` follows (the last two
/// are missing commas).
fn quote_closes_string(chars: &[char], after: usize) -> bool {
    let mut saw_newline = false;
    for (idx, &c) in chars.iter().enumerate().skip(after) {
        if c == '\n' {
            saw_newline = true;
        } else if !c.is_whitespace() {
            if saw_newline || matches!(c, ',' | '}' | ']' | ':') {
                return true;
            }
            return c == '"' && starts_key(chars, idx);
        }
    }
    true
}

fn starts_key(chars: &[char], open: usize) -> bool {
    let mut idx = open + 1;
    while idx < chars.len() && chars[idx] != '"' && chars[idx] != '\n' {
        idx += 1;
    }
    idx < chars.len() && chars[idx] == '"' && next_non_ws(chars, idx + 1) == Some(':')
}

/// Copy one string literal starting at `start` as a valid JSON string.
/// Returns the index after the closing quote.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push('"');
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some(&n) if matches!(n, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => {
                    out.push('\\');
                    out.push(n);
                    i += 2;
                }
                Some(&'u')
                    if chars.len() >= i + 6
                        && chars[i + 2..i + 6].iter().all(|h| h.is_ascii_hexdigit()) =>
                {
                    out.extend(&chars[i..i + 6]);
                    i += 6;
                }
                Some(&'\'') => {
                    out.push('\'');
                    i += 2;
                }
                _ => {
                    out.push_str("\\\\");
                    i += 1;
                }
            }
            continue;
        }

        if c == quote {
            if quote == '"' && !quote_closes_string(chars, i + 1) {
                out.push_str("\\\"");
                i += 1;
                continue;
            }
            out.push('"');
            return i + 1;
        }

        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
        i += 1;
    }

    out.push('"');
    chars.len()
}

/// Every top-level `{...}` span (depth-tracked, string-aware) mentioning
/// `"actions"`. An unterminated trailing span counts too.
fn object_spans_with_actions(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth: usize = 0;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(&text[s..]);
    }

    spans.retain(|span| span.contains("\"actions\""));
    spans
}

/// Expand every action carrying `patches: [..]` into one sibling action per
/// patch, each with a single `patch` field and otherwise identical fields.
pub fn expand_patches(value: &mut Value) {
    let Some(actions) = value.get_mut("actions").and_then(Value::as_array_mut) else {
        return;
    };

    let mut expanded = Vec::with_capacity(actions.len());
    for action in actions.drain(..) {
        let patches: Option<Vec<String>> = action
            .get("patches")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            });

        match (patches, action) {
            (Some(patches), Value::Object(mut fields)) => {
                fields.remove("patches");
                if patches.is_empty() {
                    expanded.push(Value::Object(fields));
                    continue;
                }
                for patch in patches {
                    let mut sibling = fields.clone();
                    sibling.insert("patch".to_string(), Value::String(patch));
                    expanded.push(Value::Object(sibling));
                }
            }
            (_, action) => expanded.push(action),
        }
    }
    *actions = expanded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_json_is_returned_unchanged() {
        let raw = r#"{"actions":[{"type":"write_file","path":"a.txt","content":"x—y “quoted”\ttab"}],"notes":"ok"}"#;
        let expected: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(recover_json(raw).unwrap(), expected);
    }

    #[test]
    fn missing_closers_are_appended() {
        let raw = r#"{"actions":[{"type":"write_file","path":"a.txt","content":"x"}"#;
        assert_eq!(balance_brackets(raw), format!("{raw}]}}"));
        let value = recover_json(raw).unwrap();
        assert_eq!(value["actions"][0]["content"], "x");
    }

    #[test]
    fn balancer_recovers_single_removed_closer() {
        let original = json!({
            "actions": [
                {"type": "write_file", "path": "a.txt", "content": "{ not [ a bracket"},
                {"type": "delete_path", "path": "b.txt"}
            ],
            "notes": "n"
        });
        let text = serde_json::to_string(&original).unwrap();
        let closer_positions: Vec<usize> = text
            .char_indices()
            .filter(|(_, c)| *c == '}' || *c == ']')
            .map(|(i, _)| i)
            .collect();

        // Only closers that sit right before another closer (or at the very
        // end). A closer dropped before `,` moves the next sibling into the
        // still-open container, and that text is valid nesting up to the end,
        // so there is no unique repair for it.
        for &pos in &closer_positions {
            let next = text[pos + 1..].chars().next();
            if !(next.is_none() || matches!(next, Some('}') | Some(']'))) {
                continue;
            }
            let mut damaged = text.clone();
            damaged.remove(pos);
            let recovered = recover_json(&damaged).unwrap();
            assert_eq!(recovered, original, "removed closer at {pos}");
        }
    }

    #[test]
    fn fenced_response_with_prose_is_recovered() {
        let raw = "```json\n{\"actions\": [], \"notes\": \"done\"}\n```";
        assert_eq!(recover_json(raw).unwrap()["notes"], "done");

        let prose = "Sure! Here is the plan:\n{\"actions\": [], \"notes\": \"x\"}\nHope it helps.";
        assert_eq!(recover_json(prose).unwrap()["notes"], "x");
    }

    #[test]
    fn smart_quotes_and_trailing_commas_are_repaired() {
        let raw = "{\u{201C}actions\u{201D}: [{\u{201C}type\u{201D}: \u{201C}delete_path\u{201D}, \u{201C}path\u{201D}: \u{201C}x\u{201D},},]}";
        let value = recover_json(raw).unwrap();
        assert_eq!(value["actions"][0]["path"], "x");
    }

    #[test]
    fn missing_commas_and_unquoted_keys_are_repaired() {
        let raw = "{actions: [{\"type\": \"write_file\" \"path\": \"a\", content: 'hi'}\n{\"type\": \"delete_path\", \"path\": \"b\"}]}";
        let value = recover_json(raw).unwrap();
        assert_eq!(value["actions"][0]["content"], "hi");
        assert_eq!(value["actions"][1]["path"], "b");
    }

    #[test]
    fn raw_newlines_inside_strings_are_escaped() {
        let repaired = repair_syntax("{\"content\": \"line1\nline2\"}");
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["content"], "line1\nline2");
    }

    #[test]
    fn stray_inner_quotes_and_bad_escapes_are_repaired() {
        let repaired = repair_syntax(r#"{"content": "say "hi" \d+"}"#);
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["content"], r#"say "hi" \d+"#);
    }

    #[test]
    fn largest_actions_span_wins() {
        let raw = r#"noise {"other": 1} then {"actions": [{"type": "delete_path", "path": "p"}], "notes": "big"} and {"actions": []"#;
        let value = recover_json(raw).unwrap();
        assert_eq!(value["notes"], "big");
    }

    #[test]
    fn unrecoverable_text_reports_length() {
        let err = recover_json("no json here at all").unwrap_err();
        match err {
            NebulaError::JsonRecovery { response_len, snippet } => {
                assert_eq!(response_len, 19);
                assert_eq!(snippet, "no json here at all");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn patches_expand_into_sibling_actions() {
        let mut value = json!({
            "actions": [
                {"type": "modify_file", "path": "a.rs", "patches": ["p1", "p2"], "ensurePostcondition": "x"},
                {"type": "delete_path", "path": "b"}
            ]
        });
        expand_patches(&mut value);
        let actions = value["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0]["patch"], "p1");
        assert_eq!(actions[1]["patch"], "p2");
        assert_eq!(actions[1]["ensurePostcondition"], "x");
        assert!(actions[0].get("patches").is_none());
        assert_eq!(actions[2]["path"], "b");
    }

    #[test]
    fn normalize_typography_strips_invisible_characters() {
        let text = "a\u{200B}b\u{00A0}c\u{2014}d\r\ne\u{0007}";
        assert_eq!(normalize_typography(text), "ab c-d\ne");
    }
}
