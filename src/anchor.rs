//! Anchor-based editing
//!
//! Locates a marker in file content and splices text at it. Lookup degrades
//! from the regex, to the exact literal, to the trimmed literal, to a
//! whitespace-insensitive case-insensitive match of the literal's tokens.

use crate::action::{AnchorEdit, AnchorMode, AnchorSpec};
use crate::error::{NebulaError, Result};
use crate::util::{has_crlf, to_crlf, to_lf};
use regex::{Regex, RegexBuilder};
use std::path::Path;
use tracing::debug;

/// Byte range of a located anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// First span matching `spec`, trying each lookup strategy in order.
pub fn locate(content: &str, spec: &AnchorSpec) -> Option<Span> {
    if let Some(pattern) = spec.regex.as_deref().filter(|p| !p.is_empty()) {
        match RegexBuilder::new(pattern).multi_line(true).build() {
            Ok(re) => {
                if let Some(m) = re.find(content) {
                    return Some(Span {
                        start: m.start(),
                        end: m.end(),
                    });
                }
            }
            Err(e) => debug!(pattern, error = %e, "anchor regex does not compile"),
        }
    }

    let exact = spec.exact.as_deref().filter(|e| !e.is_empty())?;
    if let Some(start) = content.find(exact) {
        return Some(Span {
            start,
            end: start + exact.len(),
        });
    }

    let trimmed = exact.trim();
    if !trimmed.is_empty() && trimmed != exact {
        if let Some(start) = content.find(trimmed) {
            return Some(Span {
                start,
                end: start + trimmed.len(),
            });
        }
    }

    let m = loose_pattern(exact)?.find(content)?;
    Some(Span {
        start: m.start(),
        end: m.end(),
    })
}

/// Tokens of `literal` joined by `\s+`, case-insensitive.
fn loose_pattern(literal: &str) -> Option<Regex> {
    let tokens: Vec<String> = literal.split_whitespace().map(regex::escape).collect();
    if tokens.is_empty() {
        return None;
    }
    RegexBuilder::new(&tokens.join(r"\s+"))
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .ok()
}

pub fn splice(content: &str, span: Span, mode: AnchorMode, text: &str) -> String {
    let mut out = String::with_capacity(content.len() + text.len());
    match mode {
        AnchorMode::Replace => {
            out.push_str(&content[..span.start]);
            out.push_str(text);
            out.push_str(&content[span.end..]);
        }
        AnchorMode::InsertBefore => {
            out.push_str(&content[..span.start]);
            out.push_str(text);
            out.push_str(&content[span.start..]);
        }
        AnchorMode::InsertAfter => {
            out.push_str(&content[..span.end]);
            out.push_str(text);
            out.push_str(&content[span.end..]);
        }
    }
    out
}

/// Apply an anchor edit to `content`, returning the new text.
///
/// Matching happens on LF-normalized text; CRLF files get their line endings
/// back afterwards. The postcondition, if any, is checked on the LF form.
pub fn apply_anchor_edit(
    path: &Path,
    content: &str,
    edit: &AnchorEdit,
    postcondition: Option<&str>,
) -> Result<String> {
    let crlf = has_crlf(content);
    let working = to_lf(content);
    let spec = AnchorSpec {
        exact: edit.spec.exact.as_deref().map(to_lf),
        regex: edit.spec.regex.clone(),
    };

    let span = locate(&working, &spec).ok_or_else(|| NebulaError::AnchorNotFound {
        path: path.to_path_buf(),
        anchor: edit.spec.describe(),
    })?;
    let edited = splice(&working, span, edit.mode, &to_lf(&edit.text));

    check_postcondition(path, &edited, postcondition)?;
    Ok(if crlf { to_crlf(&edited) } else { edited })
}

/// `result` must contain `expected` (compared with LF line endings).
pub fn check_postcondition(path: &Path, result: &str, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return Ok(());
    };
    if to_lf(result).contains(&to_lf(expected)) {
        Ok(())
    } else {
        Err(NebulaError::PostconditionUnmet {
            path: path.to_path_buf(),
            expected: expected.to_string(),
        })
    }
}
