//! Bounded preview of a CSV result artifact.
//!
//! Reads the header plus at most `limit` records into JSON row-records.
//! Quoting follows RFC 4180: fields may be wrapped in double quotes, `""`
//! escapes a quote, and quoted fields may contain commas and newlines.

use crate::errors::{Result, SandboxError};
use serde_json::{Map, Value};
use std::path::Path;

/// A bounded sample of the result rows, distinct from the full artifact.
#[derive(Debug, Clone, Default)]
pub struct TablePreview {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

/// Read the first `limit` data rows of `path` as typed row-records, in
/// on-disk order, along with the full ordered column list.
pub async fn read_csv_preview(path: &Path, limit: usize) -> Result<TablePreview> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SandboxError::OutputUnreadable(e.to_string()))?;
    parse_preview(&text, limit)
}

fn parse_preview(text: &str, limit: usize) -> Result<TablePreview> {
    let mut records = parse_records(text, limit + 1);
    if records.is_empty() {
        return Err(SandboxError::OutputUnreadable(
            "output file is empty".to_string(),
        ));
    }

    let columns = records.remove(0);
    if columns.iter().all(|c| c.is_empty()) {
        return Err(SandboxError::OutputUnreadable(
            "output file has no header row".to_string(),
        ));
    }

    let rows = records
        .into_iter()
        .take(limit)
        .map(|record| {
            let mut row = Map::new();
            for (i, column) in columns.iter().enumerate() {
                let value = record.get(i).map(|f| infer_scalar(f)).unwrap_or(Value::Null);
                row.insert(column.clone(), value);
            }
            row
        })
        .collect();

    Ok(TablePreview { columns, rows })
}

/// Split `text` into at most `max_records` CSV records of raw string fields.
fn parse_records(text: &str, max_records: usize) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
                if records.len() >= max_records {
                    return records;
                }
            }
            _ => field.push(c),
        }
    }

    // Final record without a trailing newline.
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

/// Best-effort scalar typing so previews mirror the typed frame the candidate
/// code wrote: empty → null, True/False → bool, then integer, then float,
/// otherwise string.
fn infer_scalar(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    match field {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = field.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(field.to_string())
}
