//! Unified diff parsing and application
//!
//! Model-written diffs are often slightly wrong: stale line numbers, drifted
//! context, lost prefixes, JSON quoting. [`apply_unified_diff`] runs a ladder
//! of increasingly tolerant strategies and stops at the first that succeeds:
//!
//! 1. atomic application at the declared positions, fuzz 0/2/4
//! 2. sequential per-hunk application with unbounded search, fuzz 0/2/4
//! 3. manual splicing of each hunk's old block
//!
//! Steps 1 and 2 run for both the raw and the sanitized diff, each with line
//! endings preserved and normalized to LF.

mod fuzzy;
mod sanitize;
mod splice;

pub use sanitize::{ensure_headers, sanitize_diff};
pub use splice::{manual_instructions, Placement};

use crate::error::{NebulaError, Result};
use crate::util::{has_crlf, to_crlf, to_lf};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Fuzz levels tried by the first two steps, in order.
pub const FUZZ_LEVELS: [usize; 3] = [0, 2, 4];

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }
}

/// A hunk in a unified diff. `old_start` is 0 when the header carried no
/// usable line numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (additions, removals)
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }

    /// Context and removed lines: the block this hunk expects to find.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Add(_)))
            .map(DiffLine::content)
            .collect()
    }

    pub fn old_len(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| !matches!(l, DiffLine::Add(_)))
            .count()
    }

    /// 0-based index the header says the old block starts at. Pure
    /// insertions (`-N,0`) go after line N.
    pub(crate) fn declared_index(&self) -> usize {
        if self.old_count == 0 && self.old_len() == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

/// A parsed unified diff (first file section only)
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    /// Get total additions and deletions
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

fn hunk_header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@+\s*-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s*@@").ok()
    })
    .as_ref()
}

/// `--- ` immediately followed by `+++ ` starts a file section.
pub(crate) fn is_file_header(lines: &[&str], idx: usize) -> bool {
    lines[idx].starts_with("--- ")
        && lines
            .get(idx + 1)
            .is_some_and(|next| next.starts_with("+++ "))
}

fn header_path(raw: &str, prefix: &str) -> String {
    let path = raw.trim_end_matches('\r');
    let path = path.split('\t').next().unwrap_or(path).trim();
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

/// Parse a unified diff string into structured data.
///
/// Lines keep any trailing `\r` so CRLF diffs can be matched verbatim. A
/// hunk header without line numbers (`@@ @@`) parses with `old_start` 0.
pub fn parse_unified_diff(diff: &str) -> std::result::Result<UnifiedDiff, String> {
    let lines: Vec<&str> = diff.split('\n').collect();

    let mut old_path = String::new();
    let mut new_path = String::new();
    let mut hunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if is_file_header(&lines, i) {
            if !hunks.is_empty() {
                debug!("diff touches more than one file, ignoring the rest");
                break;
            }
            old_path = header_path(&lines[i][4..], "a/");
            new_path = header_path(&lines[i + 1][4..], "b/");
            i += 2;
        } else if lines[i].starts_with("@@") {
            let hunk = parse_hunk(&lines, &mut i);
            if !hunk.lines.is_empty() {
                hunks.push(hunk);
            }
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err("No hunks found in diff".to_string());
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

/// Parse a single hunk from the diff
fn parse_hunk(lines: &[&str], idx: &mut usize) -> DiffHunk {
    let header = lines[*idx].trim_end_matches('\r');
    let captures = hunk_header_re().and_then(|re| re.captures(header));
    let (old_start, old_count, new_start, new_count) = match captures {
        Some(caps) => {
            let num = |i: usize, default: usize| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(default)
            };
            (num(1, 0), num(2, 1), num(3, 0), num(4, 1))
        }
        None => {
            debug!(header, "hunk header without line numbers");
            (0, 0, 0, 0)
        }
    };

    *idx += 1;
    let mut diff_lines = Vec::new();
    // raw blank lines, which trail hunks when the diff ends with extra newlines
    let mut blank = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];

        // Stop at next hunk, next file, or end
        if line.starts_with("@@") || line.starts_with("diff ") || is_file_header(lines, *idx) {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
            blank.push(false);
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
            blank.push(false);
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
            blank.push(false);
        } else if line.trim_end_matches('\r').is_empty() {
            diff_lines.push(DiffLine::Context(line.to_string()));
            blank.push(true);
        }
        // Skip other lines (like "\ No newline at end of file")

        *idx += 1;
    }

    while blank.last() == Some(&true) {
        blank.pop();
        diff_lines.pop();
    }

    DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    }
}

/// Content as lines; joining with `\n` gives the content back exactly.
pub(crate) fn split_lines(content: &str) -> Vec<String> {
    content.split('\n').map(str::to_string).collect()
}

/// Highest index an insertion may land on: before the empty element a
/// trailing newline leaves at the end.
pub(crate) fn insertion_limit(lines: &[String]) -> usize {
    match lines.last() {
        Some(last) if last.is_empty() => lines.len() - 1,
        _ => lines.len(),
    }
}

/// Replace the hunk's old block at `start`. Context lines keep the file's
/// version, so context that only loosely matched is never rewritten. Lines
/// past the end of the file are dropped. Returns the line delta.
pub(crate) fn splice_hunk(lines: &mut Vec<String>, start: usize, hunk: &DiffHunk) -> isize {
    let mut replacement = Vec::new();
    let mut idx = start;
    for line in &hunk.lines {
        match line {
            DiffLine::Context(_) => {
                if let Some(kept) = lines.get(idx) {
                    replacement.push(kept.clone());
                }
                idx += 1;
            }
            DiffLine::Remove(_) => idx += 1,
            DiffLine::Add(s) => replacement.push(s.clone()),
        }
    }
    let end = idx.min(lines.len());
    let delta = replacement.len() as isize - (end - start) as isize;
    lines.splice(start..end, replacement);
    delta
}

pub(crate) fn shifted(index: usize, delta: isize) -> usize {
    (index as isize + delta).max(0) as usize
}

/// Nearest start in `0..=max_start` to `expected`, within `radius`, for
/// which `fits` holds. Later candidates win ties.
pub(crate) fn nearest_start(
    max_start: usize,
    expected: usize,
    radius: usize,
    mut fits: impl FnMut(usize) -> bool,
) -> Option<usize> {
    let mut distance = 0usize;
    loop {
        if distance > expected && expected.saturating_add(distance) > max_start {
            return None;
        }
        let after = expected.saturating_add(distance);
        if after <= max_start && fits(after) {
            return Some(after);
        }
        if distance > 0 && distance <= expected && fits(expected - distance) {
            return Some(expected - distance);
        }
        if distance == radius {
            return None;
        }
        distance += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Let manual splicing fall back to the declared line number when no
    /// content matches.
    pub allow_positional_hunks: bool,
}

/// Which rung of the ladder produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum DiffStrategy {
    Atomic {
        fuzz: usize,
        sanitized: bool,
        normalized_eol: bool,
    },
    Sequential {
        fuzz: usize,
        sanitized: bool,
        normalized_eol: bool,
    },
    ManualSplice {
        positional: bool,
    },
}

impl fmt::Display for DiffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = |sanitized: bool, normalized: bool| match (sanitized, normalized) {
            (false, false) => "",
            (true, false) => ", sanitized",
            (false, true) => ", lf",
            (true, true) => ", sanitized, lf",
        };
        match *self {
            DiffStrategy::Atomic {
                fuzz,
                sanitized,
                normalized_eol,
            } => write!(f, "diff (fuzz {}{})", fuzz, variant(sanitized, normalized_eol)),
            DiffStrategy::Sequential {
                fuzz,
                sanitized,
                normalized_eol,
            } => write!(
                f,
                "diff per hunk (fuzz {}{})",
                fuzz,
                variant(sanitized, normalized_eol)
            ),
            DiffStrategy::ManualSplice { positional: false } => write!(f, "manual splice"),
            DiffStrategy::ManualSplice { positional: true } => {
                write!(f, "manual splice (positional)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub content: String,
    pub strategy: DiffStrategy,
}

/// Apply a model-written unified diff to `original`, the current content of
/// `path`. On exhaustion the error carries hunk-by-hunk manual instructions.
pub fn apply_unified_diff(
    path: &Path,
    original: &str,
    diff_text: &str,
    options: DiffOptions,
) -> Result<DiffOutcome> {
    let label = path.to_string_lossy().replace('\\', "/");
    let headed = ensure_headers(diff_text, &label);
    let sanitized = ensure_headers(&sanitize_diff(diff_text), &label);

    let mut variants = vec![(headed.as_str(), false)];
    if sanitized != headed {
        variants.push((sanitized.as_str(), true));
    }

    let original_crlf = has_crlf(original);
    let lf_original = to_lf(original);

    for &(text, is_sanitized) in &variants {
        let mut eol_modes = vec![false];
        if original_crlf || has_crlf(text) {
            eol_modes.push(true);
        }

        for normalized in eol_modes {
            let (content, body) = if normalized {
                (lf_original.clone(), to_lf(text))
            } else {
                (original.to_string(), text.to_string())
            };
            let parsed = match parse_unified_diff(&body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(sanitized = is_sanitized, error = %e, "diff variant does not parse");
                    continue;
                }
            };
            let (added, removed) = parsed.stats();
            let finish = |out: String| {
                if normalized && original_crlf {
                    to_crlf(&out)
                } else {
                    out
                }
            };

            for fuzz in FUZZ_LEVELS {
                if let Some(out) = fuzzy::apply_atomic(&content, &parsed, fuzz) {
                    let strategy = DiffStrategy::Atomic {
                        fuzz,
                        sanitized: is_sanitized,
                        normalized_eol: normalized,
                    };
                    debug!(path = %label, %strategy, added, removed, "diff applied");
                    return Ok(DiffOutcome {
                        content: finish(out),
                        strategy,
                    });
                }
            }
            for fuzz in FUZZ_LEVELS {
                if let Some(out) = fuzzy::apply_sequential(&content, &parsed, fuzz) {
                    let strategy = DiffStrategy::Sequential {
                        fuzz,
                        sanitized: is_sanitized,
                        normalized_eol: normalized,
                    };
                    debug!(path = %label, %strategy, added, removed, "diff applied");
                    return Ok(DiffOutcome {
                        content: finish(out),
                        strategy,
                    });
                }
            }
        }
    }

    let manual_source = variants
        .iter()
        .rev()
        .find_map(|(text, _)| parse_unified_diff(&to_lf(text)).ok());

    if let Some(parsed) = &manual_source {
        match splice::splice_manually(&lf_original, parsed, options.allow_positional_hunks) {
            Ok((out, placements)) => {
                let positional = placements.contains(&Placement::Positional);
                info!(path = %label, ?placements, "diff applied by manual splice");
                return Ok(DiffOutcome {
                    content: if original_crlf { to_crlf(&out) } else { out },
                    strategy: DiffStrategy::ManualSplice { positional },
                });
            }
            Err(reason) => debug!(path = %label, reason, "manual splice failed"),
        }
    }

    let manual_fix = match &manual_source {
        Some(parsed) => manual_instructions(&label, parsed),
        None => format!(
            "The diff could not be parsed. Apply it by hand:\n{}",
            sanitized
        ),
    };
    Err(NebulaError::DiffApply {
        path: path.to_path_buf(),
        manual_fix,
    })
}
