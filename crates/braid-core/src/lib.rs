//! braid-core: a dependency-aware issue tracker built on an append-only
//! event log.
//!
//! The log (`.braid/issues.jsonl`) is the only source of truth. Everything
//! else is derived: the [`store::Store`] materializes current issue state,
//! the [`graph::DepGraph`] answers blocking and ordering questions, and the
//! snapshot cache makes reopening a large workspace cheap. Divergent logs
//! from different machines merge deterministically through [`reconcile`].
//!
//! [`Workspace`] is the front door; the layers underneath are public for
//! callers that need them directly.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod graph;
pub mod lock;
pub mod model;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod workspace;

pub use error::{Error, ErrorCode, Result};
pub use workspace::{IssueDraft, OpenOptions, SyncReport, Workspace, WorkspaceStatus};
