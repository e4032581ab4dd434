//! Manual hunk splicing, the last rung of the diff ladder
//!
//! Each hunk's old block is located by content with progressively weaker
//! evidence. Removed lines are dropped and added lines inserted there, while
//! the file's own lines stay under the hunk's context. The declared line
//! number is used only when positional fallback is allowed.

use super::{
    insertion_limit, nearest_start, shifted, splice_hunk, split_lines, DiffHunk, DiffLine, UnifiedDiff,
};
use serde::Serialize;
use std::fmt::Write as _;
use tracing::warn;

/// Context lines used by the partial-context lookup.
const CONTEXT_PROBE: usize = 3;

/// How a hunk was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Exact,
    Trimmed,
    RemovedLines,
    LeadingContext,
    Insertion,
    Positional,
}

fn find_window(
    lines: &[String],
    needle: &[&str],
    expected: usize,
    eq: impl Fn(&str, &str) -> bool,
) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let max_start = lines.len().checked_sub(needle.len())?;
    nearest_start(max_start, expected, usize::MAX, |start| {
        needle
            .iter()
            .enumerate()
            .all(|(i, want)| eq(&lines[start + i], want))
    })
}

fn trimmed_eq(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// First run of consecutive old-block lines of one kind, capped at `cap`,
/// with its offset inside the old block.
fn first_run(hunk: &DiffHunk, removed: bool, cap: usize) -> Option<(usize, Vec<&str>)> {
    let old: Vec<(&str, bool)> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Context(s) => Some((s.as_str(), false)),
            DiffLine::Remove(s) => Some((s.as_str(), true)),
            DiffLine::Add(_) => None,
        })
        .collect();

    let offset = old.iter().position(|(_, r)| *r == removed)?;
    let run: Vec<&str> = old[offset..]
        .iter()
        .take_while(|(_, r)| *r == removed)
        .take(cap)
        .map(|(s, _)| *s)
        .collect();
    Some((offset, run))
}

/// Locate a run and translate it back to the start of the old block.
fn locate_by_run(lines: &[String], hunk: &DiffHunk, removed: bool, cap: usize, expected: usize) -> Option<usize> {
    let (offset, run) = first_run(hunk, removed, cap)?;
    let found = find_window(lines, &run, expected + offset, trimmed_eq)?;
    found.checked_sub(offset)
}

fn place(
    lines: &[String],
    hunk: &DiffHunk,
    expected: usize,
    allow_positional: bool,
) -> Option<(usize, Placement)> {
    let target = hunk.old_lines();
    if target.is_empty() {
        return Some((expected.min(insertion_limit(lines)), Placement::Insertion));
    }

    find_window(lines, &target, expected, |a, b| a == b)
        .map(|start| (start, Placement::Exact))
        .or_else(|| find_window(lines, &target, expected, trimmed_eq).map(|s| (s, Placement::Trimmed)))
        .or_else(|| {
            locate_by_run(lines, hunk, true, usize::MAX, expected).map(|s| (s, Placement::RemovedLines))
        })
        .or_else(|| {
            locate_by_run(lines, hunk, false, CONTEXT_PROBE, expected)
                .map(|s| (s, Placement::LeadingContext))
        })
        .or_else(|| {
            allow_positional.then(|| {
                warn!(
                    line = expected + 1,
                    "no content match for hunk, splicing at declared line"
                );
                (expected.min(lines.len()), Placement::Positional)
            })
        })
}

/// Splice every hunk in order, tracking the running line delta. Fails on
/// the first hunk that cannot be placed.
pub(crate) fn splice_manually(
    original: &str,
    diff: &UnifiedDiff,
    allow_positional: bool,
) -> Result<(String, Vec<Placement>), String> {
    let mut lines = split_lines(original);
    let mut delta: isize = 0;
    let mut placements = Vec::with_capacity(diff.hunks.len());

    for (n, hunk) in diff.hunks.iter().enumerate() {
        let expected = shifted(hunk.declared_index(), delta);
        let (start, placement) = place(&lines, hunk, expected, allow_positional)
            .ok_or_else(|| format!("hunk {} could not be located", n + 1))?;

        delta += splice_hunk(&mut lines, start, hunk);
        placements.push(placement);
    }

    Ok((lines.join("\n"), placements))
}

fn indented(out: &mut String, marker: &str, lines: &[&str]) {
    for line in lines {
        let _ = writeln!(out, "      {}{}", marker, line);
    }
}

/// Hunk-by-hunk instructions for applying a diff by hand.
pub fn manual_instructions(label: &str, diff: &UnifiedDiff) -> String {
    let mut out = format!("Manual fix for {}:\n", label);
    for (n, hunk) in diff.hunks.iter().enumerate() {
        let context: Vec<&str> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) => Some(s.as_str()),
                _ => None,
            })
            .take(CONTEXT_PROBE)
            .collect();
        let removed: Vec<&str> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Remove(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        let added: Vec<&str> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Add(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();

        let intent = match (removed.len(), added.len()) {
            (0, a) => format!("insert {} line(s)", a),
            (r, 0) => format!("delete {} line(s)", r),
            (r, a) => format!("replace {} line(s) with {}", r, a),
        };
        let near = if hunk.old_start > 0 {
            format!(" near line {}", hunk.old_start)
        } else {
            String::new()
        };
        let _ = writeln!(out, "  Hunk {}{}: {}", n + 1, near, intent);

        if !context.is_empty() {
            let _ = writeln!(out, "    Find this context:");
            indented(&mut out, "", &context);
        }
        if !removed.is_empty() {
            let _ = writeln!(out, "    Delete:");
            indented(&mut out, "- ", &removed);
        }
        if !added.is_empty() {
            let _ = writeln!(out, "    Insert:");
            indented(&mut out, "+ ", &added);
        }
    }
    out
}
