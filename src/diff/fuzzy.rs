//! Fuzzy hunk application
//!
//! Fuzz is the number of context lines allowed to differ from the file.
//! Removed lines always have to match, and at least one old line has to.

use super::{
    insertion_limit, nearest_start, shifted, splice_hunk, split_lines, DiffHunk, DiffLine, UnifiedDiff,
};

/// Search radius per fuzz level for the atomic step.
pub(crate) const OFFSET_PER_FUZZ: usize = 8;

/// Context mismatches of `hunk` at `start`, or `None` if it does not fit.
fn mismatches_at(lines: &[String], start: usize, hunk: &DiffHunk, fuzz: usize) -> Option<usize> {
    let mut idx = start;
    let mut mismatches = 0;
    let mut compared = 0;

    for line in &hunk.lines {
        let (expected, removed) = match line {
            DiffLine::Add(_) => continue,
            DiffLine::Context(s) => (s, false),
            DiffLine::Remove(s) => (s, true),
        };
        let actual = lines.get(idx)?;
        compared += 1;
        if actual != expected {
            if removed {
                return None;
            }
            mismatches += 1;
            if mismatches > fuzz {
                return None;
            }
        }
        idx += 1;
    }
    (compared == 0 || mismatches < compared).then_some(mismatches)
}

/// Best window within `radius` of `expected`: fewest mismatches, then
/// nearest. An exact fit ends the search.
fn locate(lines: &[String], hunk: &DiffHunk, expected: usize, fuzz: usize, radius: usize) -> Option<usize> {
    let old_len = hunk.old_len();
    if old_len == 0 {
        let limit = insertion_limit(lines);
        return (expected <= limit || radius > 0).then(|| expected.min(limit));
    }
    let max_start = lines.len().checked_sub(old_len)?;
    let mut best: Option<(usize, usize)> = None;
    nearest_start(max_start, expected, radius, |start| {
        match mismatches_at(lines, start, hunk, fuzz) {
            Some(m) if best.map_or(true, |(fewest, _)| m < fewest) => {
                best = Some((m, start));
                m == 0
            }
            _ => false,
        }
    });
    best.map(|(_, start)| start)
}

/// All hunks located against the untouched content near their declared
/// positions, then applied together. Fails if any hunk is missing or two
/// overlap.
pub(crate) fn apply_atomic(original: &str, diff: &UnifiedDiff, fuzz: usize) -> Option<String> {
    let mut lines = split_lines(original);
    let radius = fuzz * OFFSET_PER_FUZZ;

    let mut placements = Vec::with_capacity(diff.hunks.len());
    let mut floor = 0;
    for hunk in &diff.hunks {
        let start = locate(&lines, hunk, hunk.declared_index(), fuzz, radius)?;
        if start < floor {
            return None;
        }
        floor = start + hunk.old_len();
        placements.push(start);
    }

    for (hunk, start) in diff.hunks.iter().zip(placements).rev() {
        splice_hunk(&mut lines, start, hunk);
    }
    Some(lines.join("\n"))
}

/// Hunks applied one at a time, each searched for anywhere in the file
/// starting from its declared position adjusted by earlier hunks.
pub(crate) fn apply_sequential(original: &str, diff: &UnifiedDiff, fuzz: usize) -> Option<String> {
    let mut lines = split_lines(original);
    let mut delta: isize = 0;

    for hunk in &diff.hunks {
        let expected = shifted(hunk.declared_index(), delta);
        let start = locate(&lines, hunk, expected, fuzz, usize::MAX)?;
        delta += splice_hunk(&mut lines, start, hunk);
    }
    Some(lines.join("\n"))
}
