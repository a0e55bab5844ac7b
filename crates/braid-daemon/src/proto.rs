//! Wire protocol: newline-delimited JSON request/response envelopes.
//!
//! One JSON object per line in both directions. A request names a method
//! and carries its params; the response echoes the request id and holds
//! either a `result` or an `error`, never both. Error payloads carry the
//! stable `E####` code plus an optional hint so agents can decide without
//! parsing prose.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Default filename for the daemon's Unix socket.
pub const SOCKET_FILE: &str = "braid.sock";

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// One request line: `{"id":…,"method":…,"params":{…}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// One response line: `{"id":…,"result":{…}}` or `{"id":…,"error":{…}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn fail(id: u64, err: &RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorPayload::from_rpc(err)),
        }
    }

    /// Collapse into the result value or the error payload.
    ///
    /// # Errors
    ///
    /// Returns the error payload when the response carries one. A response
    /// with neither field is treated as an empty result.
    pub fn into_result(self) -> Result<Value, ErrorPayload> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// The `error` object on the wire: stable code, short message, optional
/// structured data (currently just the remediation hint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorPayload {
    #[must_use]
    pub fn from_rpc(err: &RpcError) -> Self {
        let code = err.code();
        let data = code
            .hint()
            .map(|hint| serde_json::json!({ "hint": hint }));
        Self {
            code: code.code().to_string(),
            message: err.to_string(),
            data,
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialize one message and terminate it with the line delimiter.
///
/// # Errors
///
/// Fails when the value cannot be serialized, which for protocol types
/// means a bug rather than bad input.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Resolve the socket path the daemon listens on by default:
/// `$XDG_RUNTIME_DIR/braid.sock`, else a per-user file under the system
/// temp directory.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir.join(SOCKET_FILE);
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "shared".to_string());
    std::env::temp_dir().join(format!("braid-{user}.sock"))
}
