//! Record data model for the braid event log.
//!
//! This module defines the [`Record`] envelope, the [`RecordBody`] enum
//! covering all 10 record types, and the payload structs each type carries.
//! Serialization to and from log lines lives in [`codec`]; the append-only
//! file itself is managed by [`log`].
//!
//! # Wire format
//!
//! One JSON object per line, internally tagged:
//!
//! ```text
//! {"ts":1708012200123456,"actor":"alice","type":"create","issue":{...}}
//! {"ts":1708012201000000,"actor":"alice","type":"close","id":"br-a3f81c2e","closed_at":1708012201000000}
//! ```
//!
//! Byte-for-byte line order matters for replay determinism prior to
//! reconciliation. Records are immutable once appended; corrections are
//! expressed as new records.

pub mod codec;
pub mod log;

pub use codec::{CodecError, ParseError, ParsedLine, RecordId, canonicalize_json, parse_line,
    parse_lines, to_line, write_line};
pub use log::{EventLog, LogEntry, RecoveryReport};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::Error;
use crate::model::dependency::DepEdge;
use crate::model::issue::{Issue, Kind, Priority, Status};
use crate::model::issue_id::IssueId;

/// A single record in the braid event log.
///
/// The envelope carries the fields every record type shares; the payload
/// lives in [`RecordBody`] and is dispatched by the `"type"` tag on the
/// wire. Record identity (the blake3 hash used for reconciliation dedup)
/// is computed from the canonical serialization, not stored on the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Wall-clock timestamp in microseconds since the Unix epoch.
    pub ts: i64,

    /// Identifier of the actor (human or agent) that produced this record.
    pub actor: String,

    /// Typed payload, tagged by record type on the wire.
    #[serde(flatten)]
    pub body: RecordBody,
}

/// Payload for each of the 10 record types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    /// Bring a new issue into existence with its full field set.
    Create { issue: Issue },
    /// Set some of an existing issue's fields.
    Update { issue: IssuePatch },
    /// Close an issue.
    Close { id: IssueId, closed_at: i64 },
    /// Reopen a closed issue. Always permitted.
    Reopen { id: IssueId },
    /// Soft-delete: hide from default queries, detach edges.
    Delete { id: IssueId },
    /// Hard-delete: the projection drops the issue permanently.
    Purge { id: IssueId },
    /// Append a comment to an issue.
    Comment { comment: CommentPayload },
    /// Add a dependency edge.
    DepAdd { dependency: DepEdge },
    /// Remove a dependency edge.
    DepRemove { dependency: DepEdge },
    /// Reconciliation could not keep a contested edge; an actor must follow
    /// up with an explicit dependency record.
    Conflict { conflict: ConflictMarker },
}

/// Partial issue payload carried by `update` records.
///
/// Only the fields present take effect on replay, which is what makes
/// field-level merge fall out of ordered replay. `assignee` distinguishes
/// absent (untouched) from `null` (cleared).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePatch {
    pub id: IssueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(
        default,
        deserialize_with = "deserialize_nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub assignee: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
}

fn deserialize_nullable<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl IssuePatch {
    /// A patch that touches nothing.
    #[must_use]
    pub const fn empty(id: IssueId) -> Self {
        Self {
            id,
            title: None,
            description: None,
            kind: None,
            status: None,
            priority: None,
            assignee: None,
            labels: None,
        }
    }

    /// Whether the patch sets no fields at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.kind.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && self.labels.is_none()
    }

    /// Names of the fields this patch sets. Drives same-field detection
    /// during reconciliation.
    #[must_use]
    pub fn fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.title.is_some() {
            out.push("title");
        }
        if self.description.is_some() {
            out.push("description");
        }
        if self.kind.is_some() {
            out.push("kind");
        }
        if self.status.is_some() {
            out.push("status");
        }
        if self.priority.is_some() {
            out.push("priority");
        }
        if self.assignee.is_some() {
            out.push("assignee");
        }
        if self.labels.is_some() {
            out.push("labels");
        }
        out
    }
}

/// Comment payload: text attached to an issue, ordered by the envelope
/// timestamp, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub issue: IssueId,
    pub text: String,
}

/// Which side of a reconciliation a withheld record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Local,
    Remote,
}

impl std::fmt::Display for ConflictSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

/// Marker left in the merged log when a contested edge was withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMarker {
    pub side: ConflictSide,
    pub dependency: DepEdge,
    pub note: String,
}

impl Record {
    #[must_use]
    pub const fn new(ts: i64, actor: String, body: RecordBody) -> Self {
        Self { ts, actor, body }
    }

    /// Wire name of this record's type tag.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match &self.body {
            RecordBody::Create { .. } => "create",
            RecordBody::Update { .. } => "update",
            RecordBody::Close { .. } => "close",
            RecordBody::Reopen { .. } => "reopen",
            RecordBody::Delete { .. } => "delete",
            RecordBody::Purge { .. } => "purge",
            RecordBody::Comment { .. } => "comment",
            RecordBody::DepAdd { .. } => "dep_add",
            RecordBody::DepRemove { .. } => "dep_remove",
            RecordBody::Conflict { .. } => "conflict",
        }
    }

    /// The single issue this record addresses, when there is one.
    ///
    /// Dependency and conflict records touch two issues and return `None`;
    /// callers handle their edges explicitly.
    #[must_use]
    pub const fn primary_issue(&self) -> Option<&IssueId> {
        match &self.body {
            RecordBody::Create { issue } => Some(&issue.id),
            RecordBody::Update { issue } => Some(&issue.id),
            RecordBody::Close { id, .. }
            | RecordBody::Reopen { id }
            | RecordBody::Delete { id }
            | RecordBody::Purge { id } => Some(id),
            RecordBody::Comment { comment } => Some(&comment.issue),
            RecordBody::DepAdd { .. } | RecordBody::DepRemove { .. } | RecordBody::Conflict { .. } => {
                None
            }
        }
    }

    /// The dependency edge this record carries, when there is one.
    #[must_use]
    pub const fn edge(&self) -> Option<&DepEdge> {
        match &self.body {
            RecordBody::DepAdd { dependency } | RecordBody::DepRemove { dependency } => {
                Some(dependency)
            }
            RecordBody::Conflict { conflict } => Some(&conflict.dependency),
            _ => None,
        }
    }

    /// Schema-level validation, run before a record is appended.
    ///
    /// Referential checks (does the issue exist, is the edge live) are the
    /// workspace's job; this only rejects records that are malformed on
    /// their own terms.
    pub fn validate(&self) -> Result<(), Error> {
        if self.actor.trim().is_empty() {
            return Err(Error::validation("actor must not be empty"));
        }
        match &self.body {
            RecordBody::Create { issue } => {
                if issue.title.trim().is_empty() {
                    return Err(Error::validation("title must not be empty"));
                }
            }
            RecordBody::Update { issue } => {
                if issue.is_empty() {
                    return Err(Error::validation("update sets no fields"));
                }
                if let Some(title) = &issue.title {
                    if title.trim().is_empty() {
                        return Err(Error::validation("title must not be empty"));
                    }
                }
            }
            RecordBody::Comment { comment } => {
                if comment.text.trim().is_empty() {
                    return Err(Error::validation("comment text must not be empty"));
                }
            }
            RecordBody::DepAdd { dependency } | RecordBody::DepRemove { dependency } => {
                if dependency.is_self_edge() {
                    return Err(Error::validation(format!(
                        "{} cannot depend on itself",
                        dependency.source
                    )));
                }
            }
            RecordBody::Close { .. }
            | RecordBody::Reopen { .. }
            | RecordBody::Delete { .. }
            | RecordBody::Purge { .. }
            | RecordBody::Conflict { .. } => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
