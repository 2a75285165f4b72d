//! Plain-text output.

use std::fmt::Write;

use event_delivery::{DlqPage, DlqStats};

const REASON_WIDTH: usize = 48;

/// One line per entry, preceded by a header.
pub fn page(page: &DlqPage) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>8}  {:<32}  {:<16}  {:>7}  {:<20}  REASON",
        "SEQ", "SUBJECT", "ERROR", "RETRIES", "STORED"
    );
    for entry in &page.entries {
        let record = &entry.record;
        let _ = writeln!(
            out,
            "{:>8}  {:<32}  {:<16}  {:>7}  {:<20}  {}",
            entry.sequence,
            record.original_subject,
            record.error_type,
            record.delivery.retry_count,
            entry.stored_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&record.failure_reason, REASON_WIDTH),
        );
    }
    let _ = write!(
        out,
        "page {} ({} per page), {} total{}",
        page.page,
        page.page_size,
        page.total,
        if page.has_more { ", more available" } else { "" }
    );
    out
}

pub fn stats(stats: &DlqStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "messages: {}", stats.total_messages);
    let _ = writeln!(out, "bytes:    {}", stats.total_bytes);
    match stats.oldest_age_seconds {
        Some(age) => {
            let _ = writeln!(out, "oldest:   {age}s");
        }
        None => {
            let _ = writeln!(out, "oldest:   -");
        }
    }
    if stats.unreadable > 0 {
        let _ = writeln!(out, "unreadable: {}", stats.unreadable);
    }
    let _ = writeln!(out, "\nby subject:");
    for (subject, count) in &stats.per_subject {
        let _ = writeln!(out, "  {subject:<40} {count:>6}");
    }
    let _ = writeln!(out, "\nby error type:");
    for (error_type, count) in &stats.per_error_type {
        let _ = writeln!(out, "  {error_type:<40} {count:>6}");
    }
    out.trim_end().to_string()
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
