//! One-shot RPC client with a direct-mode fallback.
//!
//! A call connects, sends one request line, reads one response line. When
//! the daemon cannot be reached the call is retried once in direct mode:
//! the workspace is opened in-process and the same dispatch path runs
//! against it, so both modes validate and answer identically. Errors the
//! daemon itself reports are never retried; only transport failures are.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use braid_core::OpenOptions;
use braid_core::config::{UserConfig, load_user_config};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::dispatch::Daemon;
use crate::proto::{self, ErrorPayload, Request, Response};

/// Where and how to reach the daemon, and how to behave without one.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Unix socket path; defaults to the user config, then the runtime
    /// directory.
    pub socket: Option<PathBuf>,
    /// Loopback TCP port to try when the socket cannot be reached. TCP is
    /// only attempted when a port is given explicitly.
    pub port: Option<u16>,
    /// Skip the daemon entirely and run every call in-process.
    pub no_daemon: bool,
    /// Direct mode only: replay the log instead of loading the snapshot.
    pub no_cache: bool,
    /// Actor override for direct-mode writes.
    pub actor: Option<String>,
}

/// How a call can fail, with transport kept apart from daemon answers so
/// callers can tell "nobody home" from "the operation was refused".
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon could not be reached or the connection broke mid-call.
    #[error("daemon transport: {0}")]
    Transport(#[from] std::io::Error),

    /// The far side answered with a protocol error payload.
    #[error("{0}")]
    Remote(ErrorPayload),

    /// The far side answered with something that is not a response.
    #[error("malformed response: {0}")]
    Protocol(String),
}

pub struct Client {
    options: ClientOptions,
    next_id: AtomicU64,
}

impl Client {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            next_id: AtomicU64::new(1),
        }
    }

    /// Send one request, preferring the daemon and falling back to direct
    /// mode when it is unreachable.
    ///
    /// # Errors
    ///
    /// Fails when both transports fail, or when the operation itself is
    /// refused (in which case the error payload passes through unchanged).
    pub fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        if self.options.no_daemon {
            return self.direct(method, params);
        }
        match self.call_daemon(method, params.clone()) {
            Err(ClientError::Transport(err)) => {
                debug!(error = %err, "daemon unreachable, retrying in direct mode");
                self.direct(method, params)
            }
            other => other,
        }
    }

    /// Transport-only call, for methods that only mean something against
    /// a live daemon (`daemon.status`, `daemon.stop`).
    ///
    /// # Errors
    ///
    /// Fails when the daemon cannot be reached, answers garbage, or
    /// reports a protocol error.
    pub fn call_daemon(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let request = Request::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        );
        let mut stream = self.connect()?;
        let bytes =
            proto::encode(&request).map_err(|err| ClientError::Protocol(err.to_string()))?;
        stream.write_all(&bytes)?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Protocol(
                "connection closed before a response arrived".to_string(),
            ));
        }
        let response: Response = serde_json::from_str(line.trim())
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        if response.id != request.id {
            return Err(ClientError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            )));
        }
        response.into_result().map_err(ClientError::Remote)
    }

    /// Run the request against an in-process dispatcher. Same routing,
    /// same params, no socket.
    fn direct(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let mut open = OpenOptions::new();
        if let Some(actor) = &self.options.actor {
            open = open.actor(actor.clone());
        }
        if self.options.no_cache {
            open = open.no_cache();
        }
        let daemon = Daemon::new(open);
        daemon
            .handle(Request::new(0, method, params))
            .into_result()
            .map_err(ClientError::Remote)
    }

    fn connect(&self) -> Result<ClientStream, ClientError> {
        let user = load_user_config().unwrap_or_else(|err| {
            debug!(error = %err, "user config unreadable, using defaults");
            UserConfig::default()
        });
        let socket = self
            .options
            .socket
            .clone()
            .or(user.daemon.socket)
            .unwrap_or_else(proto::default_socket_path);
        match UnixStream::connect(&socket) {
            Ok(stream) => Ok(ClientStream::Unix(stream)),
            Err(unix_err) => {
                if let Some(port) = self.options.port {
                    if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
                        return Ok(ClientStream::Tcp(stream));
                    }
                }
                Err(unix_err.into())
            }
        }
    }
}

enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(stream) => stream.read(buf),
            Self::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(stream) => stream.write(buf),
            Self::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Unix(stream) => stream.flush(),
            Self::Tcp(stream) => stream.flush(),
        }
    }
}
