use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::model::issue::ParseEnumError;
use crate::model::issue_id::IssueId;

/// The three dependency edge kinds.
///
/// Only `blocks` imposes an ordering constraint and participates in cycle
/// detection and ready/blocked computation. `discovered_from` records
/// provenance; `parent_child` records hierarchy. Neither constrains order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    Blocks,
    DiscoveredFrom,
    ParentChild,
}

impl DepKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::DiscoveredFrom => "discovered_from",
            Self::ParentChild => "parent_child",
        }
    }

    /// Whether this edge kind constrains completion order.
    #[must_use]
    pub const fn is_ordering(self) -> bool {
        matches!(self, Self::Blocks)
    }
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "blocks" => Ok(Self::Blocks),
            "discovered_from" => Ok(Self::DiscoveredFrom),
            "parent_child" | "parent" | "child" => Ok(Self::ParentChild),
            _ => Err(ParseEnumError {
                expected: "dependency kind",
                got: s.to_string(),
            }),
        }
    }
}

/// Ordered dependency edge: `source` constrains (or annotates) `target`.
///
/// For `blocks`, the target cannot complete before the source closes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepEdge {
    pub source: IssueId,
    pub target: IssueId,
    pub kind: DepKind,
}

impl DepEdge {
    #[must_use]
    pub const fn new(source: IssueId, target: IssueId, kind: DepKind) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }

    /// Whether this edge joins an issue to itself.
    #[must_use]
    pub fn is_self_edge(&self) -> bool {
        self.source == self.target
    }
}

impl fmt::Display for DepEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.kind, self.target)
    }
}
