//! Tab-separated row codec for the ledger file.
//!
//! One header line followed by one line per job. Free-text columns are
//! escaped so that a row never spans more than one line:
//! `\\` → `\\\\`, tab → `\\t`, newline → `\\n`, carriage return → `\\r`.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::job::{ErrorCategory, Job, JobStatus};

/// Column names, in file order.
pub const HEADER: [&str; 14] = [
    "job_id",
    "account",
    "payload_ref",
    "status",
    "worker_id",
    "claimed_at",
    "completed_at",
    "last_error",
    "attempts",
    "max_attempts",
    "last_attempt_at",
    "error_category",
    "error_type",
    "pass_number",
];

/// The header line, without trailing newline.
pub fn header_line() -> String {
    HEADER.join("\t")
}

/// Render a complete ledger file.
pub fn render(jobs: &[Job]) -> String {
    let mut out = header_line();
    out.push('\n');
    for job in jobs {
        out.push_str(&encode_row(job));
        out.push('\n');
    }
    out
}

/// Parse a complete ledger file.
///
/// An empty file or a header mismatch is an error: the ledger is never
/// reinterpreted or silently recreated.
pub fn parse(content: &str) -> Result<Vec<Job>, String> {
    if content.trim().is_empty() {
        return Err("file is empty (no header row)".to_string());
    }

    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default().trim_end_matches('\r');
    if header != header_line() {
        return Err(format!("unexpected header row '{header}'"));
    }

    let mut jobs = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        // +2: one for the header, one for 1-based numbering
        let job = decode_row(line).map_err(|e| format!("line {}: {e}", idx + 2))?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Encode one job as a single line (no trailing newline).
pub fn encode_row(job: &Job) -> String {
    let fields = [
        escape(&job.job_id),
        escape(&job.account),
        escape(&job.payload_ref),
        job.status.as_str().to_string(),
        escape(job.worker_id.as_deref().unwrap_or_default()),
        format_time(job.claimed_at),
        format_time(job.completed_at),
        escape(job.last_error.as_deref().unwrap_or_default()),
        job.attempts.to_string(),
        job.max_attempts.to_string(),
        format_time(job.last_attempt_at),
        job.error_category
            .map(|c| c.as_str().to_string())
            .unwrap_or_default(),
        escape(&job.error_type),
        job.pass_number.to_string(),
    ];
    fields.join("\t")
}

/// Decode one row.
pub fn decode_row(line: &str) -> Result<Job, String> {
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() != HEADER.len() {
        return Err(format!(
            "expected {} columns, found {}",
            HEADER.len(),
            cols.len()
        ));
    }

    let job_id = unescape(cols[0]);
    if job_id.is_empty() {
        return Err("empty job_id".to_string());
    }
    let account = unescape(cols[1]);
    if account.is_empty() {
        return Err(format!("job {job_id} has an empty account"));
    }

    Ok(Job {
        job_id,
        account,
        payload_ref: unescape(cols[2]),
        status: cols[3].parse()?,
        worker_id: non_empty(unescape(cols[4])),
        claimed_at: parse_time(cols[5]),
        completed_at: parse_time(cols[6]),
        last_error: non_empty(unescape(cols[7])),
        attempts: parse_count("attempts", cols[8])?,
        max_attempts: parse_count("max_attempts", cols[9])?,
        last_attempt_at: parse_time(cols[10]),
        error_category: ErrorCategory::parse_optional(cols[11])?,
        error_type: unescape(cols[12]),
        pass_number: parse_count("pass_number", cols[13])?,
    })
}

fn parse_count(column: &str, raw: &str) -> Result<u32, String> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse()
        .map_err(|_| format!("invalid {column} value '{raw}'"))
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_default()
}

/// Timestamps are parsed leniently: an unreadable value is treated as absent
/// rather than invalidating the whole ledger.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            debug!(value = raw, error = %e, "ignoring unparseable timestamp");
            None
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
