use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::model::issue_id::IssueId;

/// The five kinds of tracked issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Task,
    Bug,
    Feature,
    Epic,
    Chore,
}

impl Kind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Epic => "epic",
            Self::Chore => "chore",
        }
    }
}

impl Default for Kind {
    fn default() -> Self {
        Self::Task
    }
}

/// The four lifecycle statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl Status {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    /// Whether the issue is live (counts for ready/blocked computation).
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Validate an explicit status change requested through an update.
    ///
    /// Only `open -> in_progress` (work started) is settable directly.
    /// `blocked` is derived from open blockers and never written by a
    /// client; `closed` is entered through a `close` record and left
    /// through a `reopen` record.
    pub fn can_transition_to(self, target: Self) -> Result<(), InvalidTransition> {
        if self == target {
            return Err(InvalidTransition {
                from: self,
                to: target,
                reason: "no-op transition is not allowed",
            });
        }

        let reason = match (self, target) {
            (Self::Open, Self::InProgress) => return Ok(()),
            (_, Self::Blocked) => "blocked is derived from open blockers, not set directly",
            (_, Self::Closed) => "closing an issue takes a close record",
            (Self::Closed, _) => "closed issues come back with a reopen record",
            (Self::Blocked, _) => "blocked issues resume when their blockers close",
            _ => "transition not allowed by lifecycle rules",
        };
        Err(InvalidTransition {
            from: self,
            to: target,
            reason,
        })
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::Open
    }
}

/// Issue priority, 0 (highest) through 4 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const LOWEST: Self = Self(4);

    /// Construct a priority, rejecting values outside 0-4.
    pub const fn new(value: u8) -> Result<Self, PriorityOutOfRange> {
        if value <= 4 {
            Ok(Self(value))
        } else {
            Err(PriorityOutOfRange { got: value })
        }
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(2)
    }
}

/// Error returned when a priority value is outside 0-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority {got} out of range (0 = highest, 4 = lowest)")]
pub struct PriorityOutOfRange {
    pub got: u8,
}

impl TryFrom<u8> for Priority {
    type Error = PriorityOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All projection-level fields for one issue.
///
/// Owned by the materialized store and mutated only by replaying event
/// records; `id` and `title` are required on the wire, everything else
/// defaults so older logs stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub kind: Kind,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Issue {
    /// A fresh issue with the required fields set and everything else at
    /// its default.
    #[must_use]
    pub fn new(id: IssueId, title: impl Into<String>, created_at: i64) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            kind: Kind::default(),
            status: Status::default(),
            priority: Priority::default(),
            assignee: None,
            labels: BTreeSet::new(),
            created_at,
            updated_at: created_at,
            closed_at: None,
            deleted_at: None,
        }
    }

    /// Whether a `delete` record has soft-deleted this issue.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Live means neither closed nor soft-deleted.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.status.is_live() && !self.is_deleted()
    }
}

/// Error returned when an explicit status transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: Status,
    pub to: Status,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move {} -> {}: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for InvalidTransition {}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase().replace('-', "_")
}

impl FromStr for Kind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        match normalized.as_str() {
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "epic" => Ok(Self::Epic),
            "chore" => Ok(Self::Chore),
            _ => Err(ParseEnumError {
                expected: "kind",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        match normalized.as_str() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}
