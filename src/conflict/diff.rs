//! Line diff by longest common subsequence.
//!
//! Used to render each side of a conflicting file against its merge base.
//! The diff never decides a merge outcome.

use serde::{Deserialize, Serialize};

/// Kind of a rendered diff line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Removed,
    Added,
    Unchanged,
}

/// One line of a diff between a base text and a candidate text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub kind: DiffKind,
    pub text: String,
    /// Line number in the candidate text, 1-based. Removed lines have none.
    pub line_number: Option<usize>,
}

/// Index pairs `(base, candidate)` of one longest common subsequence, in order.
fn lcs_matches(base: &[&str], candidate: &[&str]) -> Vec<(usize, usize)> {
    let (m, n) = (base.len(), candidate.len());
    let width = n + 1;
    let mut table = vec![0usize; (m + 1) * width];

    for i in 1..=m {
        for j in 1..=n {
            table[i * width + j] = if base[i - 1] == candidate[j - 1] {
                table[(i - 1) * width + (j - 1)] + 1
            } else {
                table[(i - 1) * width + j].max(table[i * width + (j - 1)])
            };
        }
    }

    let mut matches = Vec::with_capacity(table[m * width + n]);
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if base[i - 1] == candidate[j - 1] {
            matches.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if table[(i - 1) * width + j] >= table[i * width + (j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    matches.reverse();
    matches
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').collect()
    }
}

/// Computes the line diff turning `base` into `candidate`.
///
/// Keeping only unchanged and added lines reproduces `candidate`; keeping
/// only unchanged and removed lines reproduces `base`.
pub fn diff_lines(base: &str, candidate: &str) -> Vec<DiffLine> {
    let base_lines = split_lines(base);
    let candidate_lines = split_lines(candidate);
    let matches = lcs_matches(&base_lines, &candidate_lines);

    let mut out = Vec::with_capacity(base_lines.len() + candidate_lines.len());
    let (mut bi, mut ci) = (0, 0);
    for (mb, mc) in matches {
        push_gap(&mut out, &base_lines[bi..mb], &candidate_lines[ci..mc]);
        out.push(DiffLine {
            kind: DiffKind::Unchanged,
            text: candidate_lines[mc].to_string(),
            line_number: None,
        });
        bi = mb + 1;
        ci = mc + 1;
    }
    push_gap(&mut out, &base_lines[bi..], &candidate_lines[ci..]);

    // Added and unchanged lines share the candidate numbering.
    let mut number = 1;
    for line in &mut out {
        if line.kind != DiffKind::Removed {
            line.line_number = Some(number);
            number += 1;
        }
    }
    out
}

fn push_gap(out: &mut Vec<DiffLine>, removed: &[&str], added: &[&str]) {
    out.extend(removed.iter().map(|text| DiffLine {
        kind: DiffKind::Removed,
        text: text.to_string(),
        line_number: None,
    }));
    out.extend(added.iter().map(|text| DiffLine {
        kind: DiffKind::Added,
        text: text.to_string(),
        line_number: None,
    }));
}

/// Joins the text of every line whose kind is in `kinds`.
pub fn reconstruct(lines: &[DiffLine], kinds: &[DiffKind]) -> String {
    lines
        .iter()
        .filter(|line| kinds.contains(&line.kind))
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Unified-style rendering: `-`, `+` or a space, then the line.
pub fn render(lines: &[DiffLine]) -> String {
    let mut out = String::new();
    for line in lines {
        let marker = match line.kind {
            DiffKind::Removed => '-',
            DiffKind::Added => '+',
            DiffKind::Unchanged => ' ',
        };
        out.push(marker);
        out.push(' ');
        out.push_str(&line.text);
        out.push('\n');
    }
    out
}
