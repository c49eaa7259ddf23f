//! The CSV stats table shared by save-resume files and `combine` output.
//!
//! Rows are rendered with right-justified numeric columns so that files stay
//! readable as plain text; the reader trims padding and accepts compact rows
//! too.

use std::path::Path;

use serde_json::Value;

use crate::canonical_json;
use crate::error::{Result, StatsError};
use crate::stats::{AnalysisStats, TaskStats};

pub const COLUMNS: [&str; 7] = [
    "shots",
    "errors",
    "discards",
    "seconds",
    "decoder",
    "strong_id",
    "json_metadata",
];

const COUNT_WIDTH: usize = 10;
const SECONDS_WIDTH: usize = 8;
const MAX_SECONDS_DECIMALS: i64 = 15;

pub fn render_header() -> String {
    format!(
        "{:>cw$},{:>cw$},{:>cw$},{:>sw$},{},{},{}",
        COLUMNS[0],
        COLUMNS[1],
        COLUMNS[2],
        COLUMNS[3],
        COLUMNS[4],
        COLUMNS[5],
        COLUMNS[6],
        cw = COUNT_WIDTH,
        sw = SECONDS_WIDTH,
    )
}

pub fn render_row(row: &TaskStats) -> String {
    format!(
        "{:>cw$},{:>cw$},{:>cw$},{:>sw$},{},{},{}",
        row.stats.shots,
        row.stats.errors,
        row.stats.discards,
        format_seconds(row.stats.seconds),
        escape_field(&row.decoder),
        escape_field(&row.strong_id),
        escape_field(&canonical_json(&row.json_metadata)),
        cw = COUNT_WIDTH,
        sw = SECONDS_WIDTH,
    )
}

/// Renders the header plus `rows` in the given order, newline terminated.
pub fn render_table<'a>(rows: impl IntoIterator<Item = &'a TaskStats>) -> String {
    let mut out = render_header();
    out.push('\n');
    for row in rows {
        out.push_str(&render_row(row));
        out.push('\n');
    }
    out
}

/// Formats seconds with enough decimals to show at least two significant
/// digits: `3.00`, `12.0`, `0.500`, `123`. Values needing more than 15
/// decimals switch to exponent form, `1.0e-20`.
pub fn format_seconds(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0.00".to_string();
    }
    let magnitude = seconds.log10().floor() as i64;
    let decimals = (2 - magnitude).max(0);
    if decimals > MAX_SECONDS_DECIMALS {
        return format!("{:.1e}", seconds);
    }
    format!("{:.*}", decimals as usize, seconds)
}

fn escape_field(raw: &str) -> String {
    if raw.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Splits one CSV line, honouring double-quoted fields. Whitespace outside
/// quotes is trimmed.
fn split_fields(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            ',' => {
                fields.push(finish_field(&mut current, was_quoted));
                was_quoted = false;
            }
            '"' => {
                if was_quoted || !current.trim().is_empty() {
                    return Err(format!(
                        "unexpected quote in field {}",
                        fields.len() + 1
                    ));
                }
                current.clear();
                in_quotes = true;
                was_quoted = true;
            }
            _ => {
                if was_quoted && !c.is_whitespace() {
                    return Err(format!(
                        "text after closing quote in field {}",
                        fields.len() + 1
                    ));
                }
                current.push(c);
            }
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(finish_field(&mut current, was_quoted));
    Ok(fields)
}

fn finish_field(current: &mut String, was_quoted: bool) -> String {
    let field = std::mem::take(current);
    if was_quoted {
        field
    } else {
        field.trim().to_string()
    }
}

/// Parses a stats table. `path` is only used to label errors.
pub fn parse_table(text: &str, path: &Path) -> Result<Vec<TaskStats>> {
    Ok(parse_numbered_rows(text, path)?
        .into_iter()
        .map(|(_, row)| row)
        .collect())
}

/// Like [`parse_table`], pairing each row with its 1-based line number.
pub(crate) fn parse_numbered_rows(text: &str, path: &Path) -> Result<Vec<(usize, TaskStats)>> {
    let malformed = |line: usize, reason: String| StatsError::MalformedRecord {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut rows = Vec::new();
    let mut saw_header = false;
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let fields = split_fields(raw).map_err(|reason| malformed(line_no, reason))?;
        if !saw_header {
            if fields.iter().map(String::as_str).ne(COLUMNS.iter().copied()) {
                return Err(malformed(
                    line_no,
                    format!("expected header '{}'", COLUMNS.join(",")),
                ));
            }
            saw_header = true;
            continue;
        }
        if fields.len() != COLUMNS.len() {
            return Err(malformed(
                line_no,
                format!("expected {} fields, found {}", COLUMNS.len(), fields.len()),
            ));
        }
        let count = |i: usize| -> Result<u64> {
            fields[i].parse::<u64>().map_err(|_| {
                malformed(
                    line_no,
                    format!("{} is not a non-negative integer: '{}'", COLUMNS[i], fields[i]),
                )
            })
        };
        let stats = AnalysisStats {
            shots: count(0)?,
            errors: count(1)?,
            discards: count(2)?,
            seconds: fields[3].parse::<f64>().map_err(|_| {
                malformed(line_no, format!("seconds is not a number: '{}'", fields[3]))
            })?,
        };
        stats.validate().map_err(|reason| malformed(line_no, reason))?;
        if fields[5].is_empty() {
            return Err(malformed(line_no, "strong_id is empty".to_string()));
        }
        let json_metadata: Value = serde_json::from_str(&fields[6])
            .map_err(|e| malformed(line_no, format!("json_metadata is not JSON: {}", e)))?;
        rows.push((
            line_no,
            TaskStats {
                strong_id: fields[5].clone(),
                decoder: fields[4].clone(),
                json_metadata,
                stats,
            },
        ));
    }
    Ok(rows)
}
