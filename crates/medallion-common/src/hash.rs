//! Content hashing for records
//!
//! Records are rendered to a canonical string (fields sorted by name, values in a fixed
//! locale-independent notation) and digested with SHA-256. The resulting
//! [`ContentHash`] serves as the merge key of tables without a natural business key.

use chrono::SecondsFormat;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::record::{Record, Value};

/// Column that stores the content hash of a landed record
pub const HASH_KEY_FIELD: &str = "_hash_key";

/// Hex-encoded SHA-256 digest of a record's canonical form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ContentHash> for Value {
    fn from(hash: ContentHash) -> Self {
        Value::Text(hash.0)
    }
}

/// Compute the content hash of a record
///
/// The [`HASH_KEY_FIELD`] itself is skipped so hashing a record that already carries its
/// hash gives the same digest.
pub fn content_hash(record: &Record) -> ContentHash {
    let canonical = canonical_record(record, true);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    ContentHash(hex::encode(hasher.finalize()))
}

/// Canonical string form of a record
pub fn canonical_record(record: &Record, skip_hash_field: bool) -> String {
    let mut out = String::new();
    write_record(&mut out, record, skip_hash_field);
    out
}

/// Canonical string form of a single value
///
/// Also used as a join/grouping key: numerically equal values render identically.
pub fn canonical_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_record(out: &mut String, record: &Record, skip_hash_field: bool) {
    let mut fields: Vec<(&str, &Value)> = record
        .iter()
        .filter(|(name, _)| !(skip_hash_field && *name == HASH_KEY_FIELD))
        .collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (name, value)) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_quoted(out, name);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        },
        Value::Float(f) => write_float(out, *f),
        Value::Decimal(s) => match normalize_decimal(s) {
            Some(normalized) => out.push_str(&normalized),
            // Not a plain decimal literal; keep it distinguishable from numbers.
            None => write_quoted(out, s),
        },
        Value::Text(s) => write_quoted(out, s),
        Value::Date(d) => write_quoted(out, &d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => {
            write_quoted(out, &ts.to_rfc3339_opts(SecondsFormat::Micros, true))
        },
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        },
        Value::Map(record) => write_record(out, record, false),
    }
}

fn write_float(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("\"NaN\"");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "\"Infinity\"" } else { "\"-Infinity\"" });
    } else if f == 0.0 {
        out.push('0');
    } else if f.fract() == 0.0 && f.abs() < 1e15 {
        let _ = write!(out, "{}", f as i64);
    } else {
        let _ = write!(out, "{}", f);
    }
}

/// Strip redundant signs and zeros from a decimal literal
fn normalize_decimal(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };

    let mut normalized = String::new();
    if negative && (int_part != "0" || !frac_part.is_empty()) {
        normalized.push('-');
    }
    normalized.push_str(int_part);
    if !frac_part.is_empty() {
        normalized.push('.');
        normalized.push_str(frac_part);
    }
    Some(normalized)
}

fn write_quoted(out: &mut String, s: &str) {
    // Display of a JSON string value is its escaped, quoted form.
    let _ = write!(out, "{}", serde_json::Value::String(s.to_string()));
}
