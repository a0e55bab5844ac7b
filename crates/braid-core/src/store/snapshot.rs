//! `SQLite` warm-start cache for the materialized store.
//!
//! Replaying a long log on every open is wasted work, so the workspace
//! persists its store (and the dependency edge list the graph is rebuilt
//! from) here together with a [`Cursor`] naming the log position and last
//! record identity the snapshot reflects. On the next open, a cursor that
//! still matches the log lets the workspace load the cache and replay only
//! the tail; any mismatch, a rewritten log, or a schema bump silently falls
//! back to a full replay. The cache is never authoritative and can be
//! deleted at any time.
//!
//! Runtime defaults follow the usual conservative setup:
//! - `journal_mode = WAL` so a reader can inspect the cache mid-write
//! - `busy_timeout = 5s` to ride out transient contention

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use super::{Comment, ConflictNote, Store};
use crate::error::{Error, Result};
use crate::model::dependency::DepEdge;
use crate::model::issue::Issue;
use crate::model::issue_id::IssueId;

/// Cache file name inside the workspace data directory.
pub const SNAPSHOT_FILE: &str = "cache.db";

/// Bump when the row layout changes; old caches are dropped, not migrated.
const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    position INTEGER NOT NULL,
    last_record_id TEXT
);
CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS comments (
    issue_id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS conflicts (
    seq INTEGER PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS edges (
    seq INTEGER PRIMARY KEY,
    body TEXT NOT NULL
);
";

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Where in the log a snapshot was taken.
///
/// `position` is the next position the log would hand out; the identity of
/// the record just before it pins the snapshot to one specific log content,
/// so a rewritten log (sync, compaction) can never be mistaken for the one
/// the snapshot saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub position: u64,
    pub last_record_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Handle on the on-disk cache.
#[derive(Debug)]
pub struct Snapshot {
    conn: Connection,
    path: PathBuf,
}

impl Snapshot {
    /// Open (or create) the cache, applying pragmas and the schema.
    ///
    /// A cache written by a different schema version is dropped and
    /// recreated empty.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database cannot be opened or its
    /// schema cannot be prepared.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| Error::storage(format!("open snapshot {}", path.display()), e))?;
        configure(&conn).map_err(|e| Error::storage("configure snapshot pragmas", e))?;

        let snapshot = Self { conn, path };
        snapshot.ensure_schema()?;
        Ok(snapshot)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cursor of the last saved snapshot, or `None` when the cache has
    /// never held anything.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the meta row cannot be read.
    pub fn cursor(&self) -> Result<Option<Cursor>> {
        let row = self
            .conn
            .query_row(
                "SELECT position, last_record_id FROM meta WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .map_err(|e| Error::storage("read snapshot cursor", e))?;

        let Some((position, last_record_id)) = row else {
            return Ok(None);
        };
        if position == 0 && last_record_id.is_none() {
            return Ok(None);
        }
        let position = u64::try_from(position)
            .map_err(|_| Error::storage_msg("snapshot cursor position is negative"))?;
        Ok(Some(Cursor {
            position,
            last_record_id,
        }))
    }

    /// Load the cached store and the dependency edges it was saved with.
    /// Call only when [`Snapshot::cursor`] returned a cursor the caller has
    /// verified against the log.
    ///
    /// # Errors
    ///
    /// Returns a storage error if rows cannot be read or decoded.
    pub fn load(&self) -> Result<(Store, Vec<DepEdge>)> {
        let issues = self.load_issues()?;
        let comments = self.load_comments()?;
        let conflicts = self.load_conflicts()?;
        let edges = self.load_edges()?;
        Ok((Store::from_parts(issues, comments, conflicts), edges))
    }

    fn load_issues(&self) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM issues")
            .map_err(|e| Error::storage("prepare snapshot issue read", e))?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::storage("read snapshot issues", e))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| Error::storage("read snapshot issues", e))?;

        bodies
            .iter()
            .map(|body| {
                serde_json::from_str(body).map_err(|e| Error::storage("decode snapshot issue", e))
            })
            .collect()
    }

    fn load_comments(&self) -> Result<BTreeMap<IssueId, Vec<Comment>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id, body FROM comments")
            .map_err(|e| Error::storage("prepare snapshot comment read", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::storage("read snapshot comments", e))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()
            .map_err(|e| Error::storage("read snapshot comments", e))?;

        let mut comments = BTreeMap::new();
        for (raw_id, body) in rows {
            let id: IssueId = raw_id
                .parse()
                .map_err(|e| Error::storage("decode snapshot comment key", e))?;
            let list: Vec<Comment> = serde_json::from_str(&body)
                .map_err(|e| Error::storage("decode snapshot comments", e))?;
            comments.insert(id, list);
        }
        Ok(comments)
    }

    fn load_conflicts(&self) -> Result<Vec<ConflictNote>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM conflicts ORDER BY seq")
            .map_err(|e| Error::storage("prepare snapshot conflict read", e))?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::storage("read snapshot conflicts", e))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| Error::storage("read snapshot conflicts", e))?;

        bodies
            .iter()
            .map(|body| {
                serde_json::from_str(body)
                    .map_err(|e| Error::storage("decode snapshot conflict", e))
            })
            .collect()
    }

    fn load_edges(&self) -> Result<Vec<DepEdge>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM edges ORDER BY seq")
            .map_err(|e| Error::storage("prepare snapshot edge read", e))?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::storage("read snapshot edges", e))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| Error::storage("read snapshot edges", e))?;

        bodies
            .iter()
            .map(|body| {
                serde_json::from_str(body).map_err(|e| Error::storage("decode snapshot edge", e))
            })
            .collect()
    }

    /// Replace the cache content with `store` plus its dependency edges as
    /// of `cursor`, atomically.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction cannot be completed. The
    /// previous snapshot stays intact in that case.
    pub fn save(&mut self, store: &Store, edges: &[DepEdge], cursor: &Cursor) -> Result<()> {
        let position = i64::try_from(cursor.position)
            .map_err(|_| Error::storage_msg("snapshot cursor position overflows"))?;

        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::storage("begin snapshot save", e))?;
        tx.execute_batch(
            "DELETE FROM issues; DELETE FROM comments; DELETE FROM conflicts; DELETE FROM edges;",
        )
        .map_err(|e| Error::storage("clear snapshot rows", e))?;

        {
            let mut stmt = tx
                .prepare("INSERT INTO issues (id, body) VALUES (?1, ?2)")
                .map_err(|e| Error::storage("prepare snapshot issue write", e))?;
            for issue in store.issues.values() {
                let body = serde_json::to_string(issue)
                    .map_err(|e| Error::storage("encode snapshot issue", e))?;
                stmt.execute(params![issue.id.as_str(), body])
                    .map_err(|e| Error::storage("write snapshot issue", e))?;
            }
        }
        {
            let mut stmt = tx
                .prepare("INSERT INTO comments (issue_id, body) VALUES (?1, ?2)")
                .map_err(|e| Error::storage("prepare snapshot comment write", e))?;
            for (id, list) in &store.comments {
                let body = serde_json::to_string(list)
                    .map_err(|e| Error::storage("encode snapshot comments", e))?;
                stmt.execute(params![id.as_str(), body])
                    .map_err(|e| Error::storage("write snapshot comments", e))?;
            }
        }
        {
            let mut stmt = tx
                .prepare("INSERT INTO conflicts (seq, body) VALUES (?1, ?2)")
                .map_err(|e| Error::storage("prepare snapshot conflict write", e))?;
            for (seq, note) in store.conflicts.iter().enumerate() {
                let seq = i64::try_from(seq)
                    .map_err(|_| Error::storage_msg("snapshot conflict count overflows"))?;
                let body = serde_json::to_string(note)
                    .map_err(|e| Error::storage("encode snapshot conflict", e))?;
                stmt.execute(params![seq, body])
                    .map_err(|e| Error::storage("write snapshot conflict", e))?;
            }
        }
        {
            let mut stmt = tx
                .prepare("INSERT INTO edges (seq, body) VALUES (?1, ?2)")
                .map_err(|e| Error::storage("prepare snapshot edge write", e))?;
            for (seq, edge) in edges.iter().enumerate() {
                let seq = i64::try_from(seq)
                    .map_err(|_| Error::storage_msg("snapshot edge count overflows"))?;
                let body = serde_json::to_string(edge)
                    .map_err(|e| Error::storage("encode snapshot edge", e))?;
                stmt.execute(params![seq, body])
                    .map_err(|e| Error::storage("write snapshot edge", e))?;
            }
        }

        tx.execute(
            "UPDATE meta SET position = ?1, last_record_id = ?2 WHERE id = 1",
            params![position, cursor.last_record_id],
        )
        .map_err(|e| Error::storage("write snapshot cursor", e))?;
        tx.commit()
            .map_err(|e| Error::storage("commit snapshot save", e))?;
        Ok(())
    }

    /// Drop everything, including the cursor. The next open starts cold.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the tables cannot be recreated.
    pub fn reset(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "DROP TABLE IF EXISTS issues;
                 DROP TABLE IF EXISTS comments;
                 DROP TABLE IF EXISTS conflicts;
                 DROP TABLE IF EXISTS edges;
                 DROP TABLE IF EXISTS meta;",
            )
            .map_err(|e| Error::storage("drop snapshot tables", e))?;
        self.ensure_schema()
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|e| Error::storage("create snapshot schema", e))?;

        let version: Option<i64> = self
            .conn
            .query_row("SELECT schema_version FROM meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::storage("read snapshot schema version", e))?;

        match version {
            Some(found) if found == SCHEMA_VERSION => Ok(()),
            Some(found) => {
                tracing::warn!(
                    found,
                    expected = SCHEMA_VERSION,
                    path = %self.path.display(),
                    "snapshot schema changed, dropping cache"
                );
                self.reset()
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO meta (id, schema_version, position, last_record_id) \
                         VALUES (1, ?1, 0, NULL)",
                        params![SCHEMA_VERSION],
                    )
                    .map_err(|e| Error::storage("initialize snapshot meta", e))?;
                Ok(())
            }
        }
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
