use std::fmt;

use thiserror::Error;

use crate::graph::CycleError;
use crate::lock::LockError;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    CycleDetected,
    MergeConflict,
    StorageFailed,
    WorkspaceUnavailable,
    LockContention,
    BadRequest,
    UnknownMethod,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "E1001",
            Self::NotFound => "E1002",
            Self::CycleDetected => "E2001",
            Self::MergeConflict => "E3001",
            Self::StorageFailed => "E4001",
            Self::WorkspaceUnavailable => "E4002",
            Self::LockContention => "E4003",
            Self::BadRequest => "E5001",
            Self::UnknownMethod => "E5002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidInput => "Input failed validation",
            Self::NotFound => "Issue or edge not found",
            Self::CycleDetected => "Cycle would be created",
            Self::MergeConflict => "Merge left unresolved conflicts",
            Self::StorageFailed => "Event log read or write failed",
            Self::WorkspaceUnavailable => "Workspace is quarantined",
            Self::LockContention => "Lock contention",
            Self::BadRequest => "Malformed request",
            Self::UnknownMethod => "Unknown method",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::InvalidInput => {
                Some("Check field values: title must be non-empty, priority 0-4.")
            }
            Self::NotFound => Some("List issues to confirm the id; deleted issues are hidden."),
            Self::CycleDetected => Some("Remove or reverse a blocks edge to keep the graph acyclic."),
            Self::MergeConflict => {
                Some("Inspect pending conflicts and append a resolving dependency record.")
            }
            Self::StorageFailed => Some("Check disk space and permissions, then rebuild."),
            Self::WorkspaceUnavailable => {
                Some("Run `workspace.rebuild` to restore the workspace after the storage fault.")
            }
            Self::LockContention => Some("Retry after the other braid process releases its lock."),
            Self::BadRequest => None,
            Self::UnknownMethod => Some("Run `daemon.status` to check the daemon version."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by engine operations.
///
/// Five families: validation (bad input), cycle (DAG invariant), not-found
/// (dangling reference), conflict (reconciliation residue), and storage
/// (the event log itself failed). Lock timeouts get their own variant so
/// callers can distinguish contention from corruption.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range input; fatal to the single operation,
    /// never retried automatically.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A dependency operation would break the acyclicity invariant.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// Reference to an issue or edge that does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Reconciliation left pending conflict markers that need an explicit
    /// follow-up record.
    #[error("merge left {count} unresolved conflict(s)")]
    Conflict { count: usize },

    /// The event log (or snapshot cache) could not be read or written.
    #[error("storage failure: {context}")]
    Storage {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// An advisory file lock could not be acquired in time.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn storage(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage_msg(context: impl Into<String>) -> Self {
        Self::Storage {
            context: context.into(),
            source: None,
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::InvalidInput,
            Self::Cycle(_) => ErrorCode::CycleDetected,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict { .. } => ErrorCode::MergeConflict,
            Self::Storage { .. } | Self::Lock(LockError::Io(_)) => ErrorCode::StorageFailed,
            Self::Lock(LockError::Timeout { .. }) => ErrorCode::LockContention,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            context: "io".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
