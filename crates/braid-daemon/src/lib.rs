#![forbid(unsafe_code)]

//! Local service for braid workspaces.
//!
//! The daemon owns one handle per workspace and serves the engine in
//! `braid-core` over newline-delimited JSON, on a Unix domain socket with
//! a loopback TCP fallback. Writes and the background sync task take the
//! per-workspace exclusive lock; reads share it. Nothing here adds
//! policy: every method is a thin wrapper over a `Workspace` operation,
//! and a client that cannot reach the daemon performs the same operation
//! in-process instead.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod proto;
pub mod registry;
pub mod server;
mod sync;

pub use client::{Client, ClientError, ClientOptions};
pub use dispatch::Daemon;
pub use error::{RpcError, RpcResult};
pub use proto::{ErrorPayload, Request, Response};
pub use server::{ServeOptions, serve};
