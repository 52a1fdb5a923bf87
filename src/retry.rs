//! Failure context carried from one story attempt into the next.

use std::sync::OnceLock;

use regex::Regex;

use crate::model::{LogChannel, LogEntry, RetryInfo};

/// Maximum number of error lines carried into a retry.
pub const MAX_ERROR_LINES: usize = 25;

/// Raw lines used when an attempt logged nothing that looks like an error.
pub const FALLBACK_TAIL_LINES: usize = 20;

fn error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)error|failed").expect("static regex"))
}

/// Picks the lines of a failed attempt most likely to explain the failure.
///
/// Lines on stderr or mentioning "error"/"failed" (any case) win, keeping the
/// last [`MAX_ERROR_LINES`]. When none match, the last [`FALLBACK_TAIL_LINES`]
/// lines are returned as-is.
pub fn extract_failure_lines(logs: &[LogEntry]) -> Vec<&str> {
    let matching: Vec<&str> = logs
        .iter()
        .filter(|entry| entry.channel == LogChannel::Stderr || error_pattern().is_match(&entry.text))
        .map(|entry| entry.text.as_str())
        .collect();

    if matching.is_empty() {
        let start = logs.len().saturating_sub(FALLBACK_TAIL_LINES);
        return logs[start..].iter().map(|entry| entry.text.as_str()).collect();
    }

    let start = matching.len().saturating_sub(MAX_ERROR_LINES);
    matching[start..].to_vec()
}

/// Builds the "previous attempt failed" block for the next attempt, if any.
///
/// Returns `None` on a first attempt or when no logs were captured.
pub fn build_retry_context(retry: &RetryInfo) -> Option<String> {
    if retry.retry_count == 0 {
        return None;
    }
    let last = retry.previous_logs.last().filter(|logs| !logs.is_empty())?;
    let lines = extract_failure_lines(last);
    if lines.is_empty() {
        return None;
    }

    Some(format!(
        "## Previous attempt failed\n\n\
         This is retry attempt {}. The previous attempt at this story failed. \
         The most relevant output from that attempt is below; fix the cause before doing anything else.\n\n\
         ```\n{}\n```",
        retry.retry_count,
        lines.join("\n")
    ))
}
