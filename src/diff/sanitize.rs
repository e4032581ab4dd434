//! Cleanup for diffs that went through a JSON encoder or a chat window.

use super::is_file_header;

/// Lines left behind when a diff was emitted as a JSON array of strings.
const ORPHANS: [&str; 9] = ["[", "]", "{", "}", ",", "],", "},", "\"", "\","];

/// Prepend `--- a/<label>` / `+++ b/<label>` unless the diff already has a
/// header pair. Lone header lines before the first hunk are replaced.
pub fn ensure_headers(diff: &str, label: &str) -> String {
    let lines: Vec<&str> = diff.split('\n').collect();
    if (0..lines.len()).any(|i| is_file_header(&lines, i)) {
        return diff.to_string();
    }

    let first_hunk = lines
        .iter()
        .position(|l| l.starts_with("@@"))
        .unwrap_or(lines.len());
    let body: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, l)| *i >= first_hunk || !(l.starts_with("--- ") || l.starts_with("+++ ")))
        .map(|(_, l)| *l)
        .collect();

    format!("--- a/{label}\n+++ b/{label}\n{}", body.join("\n"))
}

fn is_orphan(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || ORPHANS.contains(&trimmed)
}

fn unescape_literal(text: &str) -> String {
    text.replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
}

/// `"+    foo",` -> `+    foo`. Only lines that start with a quote, which
/// no valid diff line does. The flag reports whether the line was quoted.
fn unquote_line(line: &str) -> (String, bool) {
    let trimmed = line.trim_end_matches('\r').trim_end();
    let trimmed = trimmed.strip_suffix(',').unwrap_or(trimmed);
    if line.starts_with('"') && trimmed.len() >= 2 && trimmed.ends_with('"') {
        let inner = trimmed[1..trimmed.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\t", "\t")
            .replace("\\\\", "\\");
        (inner, true)
    } else {
        (line.to_string(), false)
    }
}

/// Repair common damage to a model-written diff:
///
/// - literal `\n` escapes in a single-line diff become newlines
/// - JSON-quoted lines are unquoted
/// - markdown fences and orphan bracket/comma lines are dropped
/// - lines inside a hunk without a diff marker become context lines
pub fn sanitize_diff(diff: &str) -> String {
    let text = if !diff.contains('\n') && diff.contains("\\n") {
        unescape_literal(diff)
    } else {
        diff.to_string()
    };

    let unquoted: Vec<(String, bool)> = text
        .split('\n')
        .map(unquote_line)
        .filter(|(l, _)| !l.trim_start().starts_with("```"))
        .collect();

    // In a JSON-encoded diff every real line was quoted; the rest is debris.
    let json_encoded = unquoted.iter().any(|(_, quoted)| *quoted);
    let mut lines: Vec<String> = unquoted
        .into_iter()
        .filter(|(l, quoted)| *quoted || !(json_encoded && is_orphan(l)))
        .map(|(l, _)| l)
        .collect();

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let mut out: Vec<String> = Vec::with_capacity(refs.len());
    let mut in_hunk = false;
    let mut i = 0;

    while i < refs.len() {
        let line = refs[i];
        if is_file_header(&refs, i) {
            in_hunk = false;
            out.push(line.to_string());
            out.push(refs[i + 1].to_string());
            i += 2;
            continue;
        }

        if line.starts_with("@@") {
            in_hunk = true;
            out.push(line.to_string());
        } else if in_hunk {
            match line.chars().next() {
                Some(' ' | '+' | '-' | '\\') => out.push(line.to_string()),
                _ if line.starts_with("diff ") => {
                    in_hunk = false;
                    out.push(line.to_string());
                }
                _ => out.push(format!(" {}", line)),
            }
        } else if !is_orphan(line) {
            out.push(line.to_string());
        }
        i += 1;
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_synthesized_once() {
        let with = ensure_headers("@@ -1 +1 @@\n-a\n+b", "src/x.rs");
        assert!(with.starts_with("--- a/src/x.rs\n+++ b/src/x.rs\n@@"));
        assert_eq!(ensure_headers(&with, "src/x.rs"), with);
    }

    #[test]
    fn lone_header_is_replaced() {
        let with = ensure_headers("+++ b/x.rs\n@@ -1 +1 @@\n-a\n+b", "x.rs");
        assert_eq!(with.matches("+++ ").count(), 1);
    }

    #[test]
    fn markerless_lines_become_context() {
        let out = sanitize_diff("@@ -1,3 +1,3 @@\nfn main() {\n-old\n+new\n}\n");
        assert_eq!(out, "@@ -1,3 +1,3 @@\n fn main() {\n-old\n+new\n }");
    }

    #[test]
    fn json_artifacts_are_removed() {
        let out = sanitize_diff("```diff\n[\n\"@@ -1 +1 @@\",\n\"-\\\"a\\\"\",\n\"+b\"\n],\n```");
        assert_eq!(out, "@@ -1 +1 @@\n-\"a\"\n+b");
    }

    #[test]
    fn escaped_single_line_diff_is_expanded() {
        assert_eq!(sanitize_diff("@@ -1 +1 @@\\n-a\\n+b"), "@@ -1 +1 @@\n-a\n+b");
    }
}
