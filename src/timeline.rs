//! Human-readable summaries of a completed batch of invocations.
//!
//! Diagnostics only: nothing here affects engine correctness, and the text
//! layout is not a machine-readable contract.

use std::cmp::Reverse;
use std::fmt::Write;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::OnceError;
use crate::record::Invocation;

const BAR_WIDTH: usize = 64;
const NAME_WIDTH: usize = 64;

/// Renders a summary block plus one row per invocation: name, state,
/// duration, and a fixed-width bar showing its begin/end interval relative
/// to the overall window.
pub fn timeline(invocations: &[Arc<Invocation>]) -> String {
    let mut out = String::new();

    let begin = invocations.iter().filter_map(|i| i.begin()).min();
    let end = invocations.iter().filter_map(|i| i.end()).max();
    let success = invocations.iter().all(|i| !i.failed());

    let _ = writeln!(out, "Summary");
    let _ = writeln!(out, "success:  {success}");
    if let (Some(begin), Some(end)) = (begin, end) {
        let _ = writeln!(out, "begin:    {begin}");
        let _ = writeln!(out, "end:      {end}");
        let _ = writeln!(out, "duration: {}", human_duration(end - begin));
    }
    let _ = writeln!(out);

    let mut rows: Vec<_> = invocations.iter().collect();
    rows.sort_by_key(|i| i.end());

    for row in rows {
        let duration = row.duration().map(human_duration).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<name$} {:<10} {:>8} {}",
            truncate(&row.to_string(), NAME_WIDTH),
            row.state().to_string(),
            duration,
            time_bar(BAR_WIDTH, begin, end, row.begin(), row.end()),
            name = NAME_WIDTH,
        );
    }

    out
}

/// Lists every failed invocation, latest first, with the deepest
/// non-wrapper cause and the wrapper location the identity was built at.
pub fn failures(invocations: &[Arc<Invocation>]) -> String {
    let mut out = String::new();

    let mut failed: Vec<_> = invocations.iter().filter(|i| i.failed()).collect();
    failed.sort_by_key(|i| Reverse(i.end()));

    for invocation in failed {
        if let Some(cause) = invocation.error() {
            let root = cause.root_cause();
            // A failure whose deepest cause is another memoized call's
            // wrapper error is already reported by that call's own row.
            if matches!(
                root.downcast_ref::<OnceError>(),
                Some(OnceError::InvocationFailed { .. })
            ) {
                continue;
            }
            let location = invocation.id().location();
            let _ = writeln!(
                out,
                "{}:{}: target {invocation} failed. Reason: {root}",
                location.file(),
                location.line(),
            );
        }
    }

    out.push_str("FAILED\n");
    out
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Easy readable text format for a duration.
pub fn human_duration(duration: TimeDelta) -> String {
    let secs = duration.num_milliseconds().max(0) as f64 / 1000.0;
    let days = secs / 86400.0;
    if days > 10.0 {
        return format!("{days:.0}d");
    }
    if days > 1.0 {
        return format!("{}d{}h", duration.num_days(), duration.num_hours() % 24);
    }
    let hours = secs / 3600.0;
    if hours > 1.0 {
        return format!("{}h{}m", duration.num_hours(), duration.num_minutes() % 60);
    }
    let minutes = secs / 60.0;
    if minutes > 30.0 {
        return format!("{}m", duration.num_minutes());
    }
    if minutes > 1.0 {
        return format!("{}m{}s", duration.num_minutes(), duration.num_seconds() % 60);
    }
    if secs >= 1.0 {
        return format!("{}s", duration.num_seconds());
    }
    format!("{}ms", duration.num_milliseconds().max(0))
}

/// Represents a time interval within a larger window as a fixed-width bar.
fn time_bar(
    width: usize,
    range_begin: Option<DateTime<Utc>>,
    range_end: Option<DateTime<Utc>>,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> String {
    let (Some(range_begin), Some(range_end), Some(begin), Some(end)) =
        (range_begin, range_end, begin, end)
    else {
        return " ".repeat(width);
    };
    if range_begin >= range_end {
        return "#".repeat(width);
    }

    let total = (range_end - range_begin).num_milliseconds() as f64;
    let pos = |t: DateTime<Utc>| {
        let t = t.clamp(range_begin, range_end);
        (((t - range_begin).num_milliseconds() as f64 / total) * width as f64) as usize
    };

    let from = pos(begin).min(width - 1);
    let to = pos(end).clamp(from + 1, width);
    format!(
        "{}{}{}",
        " ".repeat(from),
        "#".repeat(to - from),
        " ".repeat(width - to)
    )
}
