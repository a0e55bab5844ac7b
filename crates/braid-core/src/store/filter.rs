//! Filter and sort criteria for issue listings.
//!
//! [`IssueFilter`] carries optional criteria combined with AND semantics;
//! [`SortOrder`] picks the listing order. Both are plain data so the RPC
//! layer can deserialize them straight off a request.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Comment;
use crate::model::issue::{Issue, Kind, ParseEnumError, Priority, Status};

// ---------------------------------------------------------------------------
// Tokenizing
// ---------------------------------------------------------------------------

/// Split text into lowercase alphanumeric search tokens.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// All search tokens for an issue: title plus description.
#[must_use]
pub fn issue_tokens(issue: &Issue) -> BTreeSet<String> {
    let mut tokens = tokenize(&issue.title);
    tokens.extend(tokenize(&issue.description));
    tokens
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// Sort order for issue listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Priority ascending, then most recently updated first.
    #[default]
    Priority,
    /// Most recently updated first.
    UpdatedDesc,
    /// Stalest update first.
    UpdatedAsc,
    /// Most recently created first.
    CreatedDesc,
    /// Oldest first.
    CreatedAsc,
}

impl SortOrder {
    /// Total order over issues; every variant tie-breaks by id so listings
    /// are stable across rebuilds.
    #[must_use]
    pub fn compare(self, a: &Issue, b: &Issue) -> Ordering {
        let ranked = match self {
            Self::Priority => a
                .priority
                .cmp(&b.priority)
                .then(b.updated_at.cmp(&a.updated_at)),
            Self::UpdatedDesc => b.updated_at.cmp(&a.updated_at),
            Self::UpdatedAsc => a.updated_at.cmp(&b.updated_at),
            Self::CreatedDesc => b.created_at.cmp(&a.created_at),
            Self::CreatedAsc => a.created_at.cmp(&b.created_at),
        };
        ranked.then_with(|| a.id.cmp(&b.id))
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::UpdatedDesc => "updated_desc",
            Self::UpdatedAsc => "updated_asc",
            Self::CreatedDesc => "created_desc",
            Self::CreatedAsc => "created_asc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" | "triage" => Ok(Self::Priority),
            "updated_desc" | "updated-desc" | "recent" => Ok(Self::UpdatedDesc),
            "updated_asc" | "updated-asc" | "stale" => Ok(Self::UpdatedAsc),
            "created_desc" | "created-desc" | "newest" => Ok(Self::CreatedDesc),
            "created_asc" | "created-asc" | "oldest" => Ok(Self::CreatedAsc),
            other => Err(ParseEnumError {
                expected: "sort order",
                got: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filter criteria for issue listings. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueFilter {
    /// Exact status match.
    pub status: Option<Status>,
    /// Exact kind match.
    pub kind: Option<Kind>,
    /// Numerically lowest priority to admit (0 is the most urgent).
    pub priority_min: Option<Priority>,
    /// Numerically highest priority to admit.
    pub priority_max: Option<Priority>,
    /// Issue must be assigned to this actor.
    pub assignee: Option<String>,
    /// Issue must carry this label.
    pub label: Option<String>,
    /// Every token of this query must appear in the issue's title,
    /// description, or comments.
    pub text: Option<String>,
    /// Include soft-deleted issues.
    pub include_deleted: bool,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Skip this many results first.
    pub offset: Option<usize>,
    /// Listing order.
    pub sort: SortOrder,
}

impl IssueFilter {
    /// Whether an issue satisfies every set criterion. `comments` feed the
    /// text match; pass the issue's comments or an empty slice.
    #[must_use]
    pub fn matches(&self, issue: &Issue, comments: &[Comment]) -> bool {
        if issue.is_deleted() && !self.include_deleted {
            return false;
        }
        if self.status.is_some_and(|status| issue.status != status) {
            return false;
        }
        if self.kind.is_some_and(|kind| issue.kind != kind) {
            return false;
        }
        if self.priority_min.is_some_and(|min| issue.priority < min) {
            return false;
        }
        if self.priority_max.is_some_and(|max| issue.priority > max) {
            return false;
        }
        if self
            .assignee
            .as_ref()
            .is_some_and(|assignee| issue.assignee.as_ref() != Some(assignee))
        {
            return false;
        }
        if self
            .label
            .as_ref()
            .is_some_and(|label| !issue.labels.contains(label))
        {
            return false;
        }
        if let Some(text) = &self.text {
            let wanted = tokenize(text);
            if !wanted.is_empty() {
                let mut have = issue_tokens(issue);
                for comment in comments {
                    have.extend(tokenize(&comment.text));
                }
                if !wanted.is_subset(&have) {
                    return false;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
