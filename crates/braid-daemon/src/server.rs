//! Accept loop and connection handling.
//!
//! The daemon listens on a Unix domain socket, falling back to loopback
//! TCP where domain sockets cannot be bound. Each connection gets its own
//! thread and speaks newline-delimited JSON: read a line, dispatch, write
//! a line, repeat until the peer hangs up. The accept loop polls the stop
//! flag so a `daemon.stop` request winds the whole process down.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use braid_core::OpenOptions;
use braid_core::config::load_user_config;
use tracing::{debug, info, warn};

use crate::dispatch::Daemon;
use crate::error::RpcError;
use crate::proto::{self, Request, Response};
use crate::sync;

/// How often the accept loop wakes to poll the stop flag.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Transport and identity settings for one daemon process.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Unix socket path; defaults to the user config, then the runtime
    /// directory.
    pub socket: Option<PathBuf>,
    /// Loopback TCP port; defaults to the user config.
    pub port: Option<u16>,
    /// Actor override for records written through this daemon.
    pub actor: Option<String>,
}

/// Run the daemon in the foreground until a `daemon.stop` request.
///
/// # Errors
///
/// Fails when another daemon already owns the socket, or when neither
/// the socket nor the TCP fallback can be bound.
pub fn serve(options: ServeOptions) -> anyhow::Result<()> {
    let mut open = OpenOptions::new();
    if let Some(actor) = &options.actor {
        open = open.actor(actor.clone());
    }
    let daemon = Arc::new(Daemon::new(open));

    let listener = bind(&options)?;
    info!(endpoint = %listener.endpoint(), "daemon listening");

    let sync_daemon = Arc::clone(&daemon);
    let sync_task = thread::spawn(move || sync::run(&sync_daemon));

    accept_loop(&listener, &daemon);

    if let Listener::Unix(_, path) = &listener {
        if let Err(err) = std::fs::remove_file(path) {
            debug!(error = %err, "socket file already gone");
        }
    }
    if sync_task.join().is_err() {
        warn!("sync task panicked");
    }
    info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl Listener {
    fn endpoint(&self) -> String {
        match self {
            Self::Unix(_, path) => path.display().to_string(),
            Self::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.to_string()),
        }
    }
}

enum Conn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Conn {
    fn set_blocking(&self) -> std::io::Result<()> {
        match self {
            Self::Unix(stream) => stream.set_nonblocking(false),
            Self::Tcp(stream) => stream.set_nonblocking(false),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(stream) => stream.read(buf),
            Self::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for Conn {
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

enum BindError {
    /// Another live daemon answered on the socket.
    AlreadyRunning,
    Io(std::io::Error),
}

fn bind(options: &ServeOptions) -> anyhow::Result<Listener> {
    let user = load_user_config().context("load user config")?;
    let socket = options
        .socket
        .clone()
        .or(user.daemon.socket)
        .unwrap_or_else(proto::default_socket_path);
    match bind_unix(&socket) {
        Ok(listener) => {
            listener
                .set_nonblocking(true)
                .context("configure socket listener")?;
            Ok(Listener::Unix(listener, socket))
        }
        Err(BindError::AlreadyRunning) => anyhow::bail!(
            "another daemon is already listening on {}",
            socket.display()
        ),
        Err(BindError::Io(err)) => {
            let port = options.port.unwrap_or(user.daemon.port);
            warn!(
                socket = %socket.display(),
                error = %err,
                "domain socket unavailable, falling back to loopback tcp"
            );
            let listener = TcpListener::bind(("127.0.0.1", port))
                .with_context(|| format!("bind 127.0.0.1:{port}"))?;
            listener
                .set_nonblocking(true)
                .context("configure tcp listener")?;
            Ok(Listener::Tcp(listener))
        }
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener, BindError> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(BindError::AlreadyRunning);
            }
            // Leftover socket file from a daemon that died without cleanup.
            std::fs::remove_file(path).map_err(BindError::Io)?;
            UnixListener::bind(path).map_err(BindError::Io)
        }
        Err(err) => Err(BindError::Io(err)),
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

fn accept_loop(listener: &Listener, daemon: &Arc<Daemon>) {
    while !daemon.stop_requested() {
        let accepted = match listener {
            Listener::Unix(listener, _) => match listener.accept() {
                Ok((stream, _)) => Some(Conn::Unix(stream)),
                Err(err) => {
                    accept_failed(&err);
                    None
                }
            },
            Listener::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => Some(Conn::Tcp(stream)),
                Err(err) => {
                    accept_failed(&err);
                    None
                }
            },
        };
        match accepted {
            Some(conn) => {
                if let Err(err) = conn.set_blocking() {
                    warn!(error = %err, "configure accepted connection");
                    continue;
                }
                let daemon = Arc::clone(daemon);
                thread::spawn(move || handle_connection(conn, &daemon));
            }
            None => thread::sleep(ACCEPT_POLL),
        }
    }
}

fn accept_failed(err: &std::io::Error) {
    if err.kind() != std::io::ErrorKind::WouldBlock {
        warn!(error = %err, "accept failed");
    }
}

/// Serve one connection until the peer disconnects. A line that does not
/// parse still gets an answer, with request id `0` since none was read.
fn handle_connection(stream: Conn, daemon: &Daemon) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "connection read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => daemon.handle(request),
            Err(err) => Response::fail(
                0,
                &RpcError::BadRequest(format!("parse request: {err}")),
            ),
        };
        if let Err(err) = write_response(reader.get_mut(), &response) {
            debug!(error = %err, "connection write failed");
            break;
        }
        if daemon.stop_requested() {
            break;
        }
    }
}

fn write_response(stream: &mut Conn, response: &Response) -> std::io::Result<()> {
    let bytes = proto::encode(response).map_err(std::io::Error::other)?;
    stream.write_all(&bytes)?;
    stream.flush()
}
