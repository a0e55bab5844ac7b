//! Line-level codec for the event log.
//!
//! Three concerns live here:
//!
//! - serializing a [`Record`] to a single JSONL line ([`to_line`],
//!   [`write_line`])
//! - parsing lines back, tolerating comments, blanks, and unknown record
//!   types from newer versions ([`parse_line`], [`parse_lines`])
//! - computing the content-addressed identity of a record
//!   ([`RecordId`]), a blake3 hash over the canonical (sorted-key) JSON
//!   form so the identity survives reserialization by any JSON library
//!
//! The torn-write rule (drop a final unterminated line) is applied by the
//! log layer before lines reach this module; everything here assumes
//! complete lines.

use serde_json::Value;
use thiserror::Error;

use super::Record;
use super::log::LogEntry;

/// Record types this version understands. Lines with other type tags are
/// skipped (with a warning) so newer peers can extend the format without
/// breaking older readers.
pub const KNOWN_TYPES: &[&str] = &[
    "create",
    "update",
    "close",
    "reopen",
    "delete",
    "purge",
    "comment",
    "dep_add",
    "dep_remove",
    "conflict",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure to turn a [`Record`] into a log line or identity.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A serialized record may never span lines; one line, one record.
    #[error("record serialization contains a newline")]
    NewlineInRecord,

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write record line: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to parse a single log line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record line is not a JSON object")]
    NotAnObject,

    #[error("record is missing a string \"type\" field")]
    MissingType,

    /// Recoverable: [`parse_lines`] skips these instead of failing.
    #[error("unknown record type {0:?}")]
    UnknownType(String),

    #[error("malformed {record_type} record: {source}")]
    Schema {
        record_type: String,
        source: serde_json::Error,
    },

    #[error("could not compute record identity: {0}")]
    Identity(#[from] CodecError),
}

/// A parse error tagged with its 1-indexed line number.
#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct LineError {
    pub line: usize,
    #[source]
    pub source: ParseError,
}

// ---------------------------------------------------------------------------
// Canonical form and identity
// ---------------------------------------------------------------------------

/// Serialize a JSON value with object keys sorted at every depth.
///
/// Two lines that differ only in key order or whitespace canonicalize to
/// the same string, which is what makes [`RecordId`] stable across
/// reserialization.
#[must_use]
pub fn canonicalize_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on Value handles JSON string escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            // Null, bool, number, string: compact Display form is already
            // canonical.
            let _ = std::fmt::Write::write_fmt(out, format_args!("{scalar}"));
        }
    }
}

/// Content-addressed identity of a record: `blake3:` followed by the hex
/// digest of the canonical JSON form.
///
/// Identities are never written to the log; both sides of a
/// reconciliation recompute them, so they have to agree byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Compute the identity of a record.
    pub fn of(record: &Record) -> Result<Self, CodecError> {
        let value = serde_json::to_value(record)?;
        let canonical = canonicalize_json(&value);
        let hash = blake3::hash(canonical.as_bytes());
        Ok(Self(format!("blake3:{}", hash.to_hex())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a string has the shape of a record identity. Used when
    /// reading identities back from the snapshot cursor.
    #[must_use]
    pub fn well_formed(s: &str) -> bool {
        let Some(hex) = s.strip_prefix("blake3:") else {
            return false;
        };
        hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a record to a single line, without the trailing newline.
pub fn to_line(record: &Record) -> Result<String, CodecError> {
    let line = serde_json::to_string(record)?;
    if line.contains('\n') {
        return Err(CodecError::NewlineInRecord);
    }
    Ok(line)
}

/// Write a record as one newline-terminated line.
pub fn write_line<W: std::io::Write>(writer: &mut W, record: &Record) -> Result<(), CodecError> {
    let line = to_line(record)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Outcome of parsing one log line.
#[derive(Debug)]
pub enum ParsedLine {
    /// Empty or whitespace-only line.
    Blank,
    /// Line starting with `#`.
    Comment,
    Record(Box<Record>),
}

/// Parse a single line.
///
/// Blank lines and `#` comments are tolerated so logs survive casual
/// hand-editing. Unknown record types surface as
/// [`ParseError::UnknownType`] so the caller can decide to skip.
pub fn parse_line(line: &str) -> Result<ParsedLine, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ParsedLine::Blank);
    }
    if trimmed.starts_with('#') {
        return Ok(ParsedLine::Comment);
    }

    let value: Value = serde_json::from_str(trimmed)?;
    let record_type = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(ParseError::MissingType),
        },
        _ => return Err(ParseError::NotAnObject),
    };
    if !KNOWN_TYPES.contains(&record_type.as_str()) {
        return Err(ParseError::UnknownType(record_type));
    }

    let record: Record = serde_json::from_value(value).map_err(|source| ParseError::Schema {
        record_type,
        source,
    })?;
    Ok(ParsedLine::Record(Box::new(record)))
}

/// Parse a whole log body into positioned entries.
///
/// Positions are 0-based record indexes: comments and blanks consume no
/// position, but skipped unknown-type records do, so positions agree with
/// peers that understand those types.
pub fn parse_lines(input: &str) -> Result<Vec<LogEntry>, LineError> {
    let mut entries = Vec::new();
    let mut position: u64 = 0;

    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        match parse_line(line) {
            Ok(ParsedLine::Blank | ParsedLine::Comment) => {}
            Ok(ParsedLine::Record(record)) => {
                let id = RecordId::of(&record).map_err(|source| LineError {
                    line: line_no,
                    source: ParseError::Identity(source),
                })?;
                entries.push(LogEntry {
                    position,
                    id,
                    record: *record,
                });
                position += 1;
            }
            Err(ParseError::UnknownType(record_type)) => {
                tracing::warn!(line = line_no, record_type, "skipping unknown record type");
                position += 1;
            }
            Err(source) => {
                return Err(LineError {
                    line: line_no,
                    source,
                });
            }
        }
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
