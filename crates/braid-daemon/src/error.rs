//! Daemon-side error taxonomy.
//!
//! Engine errors pass through untouched; the daemon adds only the failure
//! modes that exist because there is a daemon at all: a quarantined
//! workspace, a request that does not parse, and a method nobody knows.

use braid_core::{Error as CoreError, ErrorCode};
use thiserror::Error;

/// Everything a request handler can fail with.
#[derive(Debug, Error)]
pub enum RpcError {
    /// An engine operation failed; carries the full typed error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The workspace hit a storage fault earlier and refuses requests
    /// until a `workspace.rebuild` succeeds.
    #[error("workspace unavailable: {reason}")]
    Unavailable { reason: String },

    /// The request envelope or params did not parse.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The method name is not part of the protocol.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

impl RpcError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Stable wire code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Core(err) => err.code(),
            Self::Unavailable { .. } => ErrorCode::WorkspaceUnavailable,
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_variant() {
        assert_eq!(
            RpcError::unavailable("storage fault").code().code(),
            "E4002"
        );
        assert_eq!(RpcError::BadRequest("nope".into()).code().code(), "E5001");
        assert_eq!(
            RpcError::UnknownMethod("issue.zap".into()).code().code(),
            "E5002"
        );
        assert_eq!(
            RpcError::from(CoreError::validation("empty title"))
                .code()
                .code(),
            "E1001"
        );
    }

    #[test]
    fn core_errors_render_transparently() {
        let err = RpcError::from(CoreError::not_found("issue", "br-00000000"));
        assert_eq!(err.to_string(), "issue not found: br-00000000");
    }
}
