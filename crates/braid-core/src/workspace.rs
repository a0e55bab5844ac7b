//! One tracked workspace: the event log plus everything derived from it.
//!
//! [`Workspace`] ties the layers together. The `.braid/` directory holds
//! the append-only log (`issues.jsonl`), the snapshot cache (`cache.db`),
//! and optional configuration (`config.toml`). Opening a workspace loads
//! the snapshot and replays only the log tail written since it was taken;
//! when the snapshot is missing, stale, or pinned to a log that has since
//! been rewritten, the projection is rebuilt from position zero instead.
//!
//! Mutations follow one path: validate against the current projection,
//! append the record (fsynced), apply it to store and graph, then save the
//! snapshot. Validation runs before the append so a rejected operation
//! (bad input, dangling reference, cycle-closing edge) never reaches disk.
//! The snapshot save is best effort; the log alone is authoritative.
//!
//! Several processes may share one workspace directory. Appends interleave
//! safely through the log's advisory lock, and a handle folds in records
//! other writers appended, either on its own next append or through an
//! explicit [`Workspace::refresh`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{self, EffectiveConfig};
use crate::error::{Error, Result};
use crate::graph::DepGraph;
use crate::model::dependency::DepEdge;
use crate::model::issue::{Issue, Kind, Priority, Status};
use crate::model::issue_id::IssueId;
use crate::reconcile::{self, MergeOutcome};
use crate::record::log::LOG_FILE;
use crate::record::{CommentPayload, EventLog, IssuePatch, LogEntry, Record, RecordBody, RecordId};
use crate::store::snapshot::SNAPSHOT_FILE;
use crate::store::{Comment, ConflictNote, Cursor, IssueFilter, Snapshot, Store};

/// Name of the workspace data directory.
pub const DATA_DIR: &str = ".braid";

// ---------------------------------------------------------------------------
// Open options
// ---------------------------------------------------------------------------

/// Builder for opening a [`Workspace`] with non-default settings.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    actor: Option<String>,
    no_cache: bool,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the configured actor for records written through this
    /// handle.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Skip the snapshot cache entirely: open with a full replay and never
    /// write `cache.db`.
    #[must_use]
    pub const fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Open the workspace rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails when the data directory cannot be created, the log cannot be
    /// opened or parsed, or a present config file is malformed.
    pub fn open(self, root: impl Into<PathBuf>) -> Result<Workspace> {
        Workspace::open_with(root.into(), self)
    }
}

// ---------------------------------------------------------------------------
// Inputs and reports
// ---------------------------------------------------------------------------

/// Fields for a new issue. Everything except the title is optional.
#[derive(Debug, Clone, Default)]
pub struct IssueDraft {
    pub title: String,
    pub description: String,
    pub kind: Kind,
    pub priority: Priority,
    pub assignee: Option<String>,
    pub labels: BTreeSet<String>,
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Records applied to the projection.
    pub applied: usize,
    /// Records that parsed but could not be applied (dangling reference,
    /// cycle-closing edge) and were skipped with a warning.
    pub skipped: usize,
}

/// What [`Workspace::refresh`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing new in the log.
    Clean,
    /// Another writer had appended; that many records were folded in.
    CaughtUp(usize),
    /// The log was rewritten underneath this handle; the projection was
    /// rebuilt from position zero.
    Rebuilt,
}

/// Result of a [`Workspace::pull`] or [`Workspace::push`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: MergeOutcome,
    /// Length of the merged record sequence.
    pub records: usize,
    /// Records dropped because every field they touched was re-touched
    /// later.
    pub superseded: usize,
    /// Dependency edges withheld to keep the `blocks` graph acyclic.
    pub withheld: usize,
    /// Whether any log (local or remote) was rewritten.
    pub changed: bool,
}

/// Point-in-time summary of a workspace, cheap to compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub root: PathBuf,
    pub actor: String,
    /// Issue counts per status, excluding soft-deleted issues.
    pub issues: BTreeMap<String, usize>,
    pub ready: usize,
    pub blocked: usize,
    pub edges: usize,
    pub conflicts: usize,
    /// Records this handle has applied from the log.
    pub log_records: u64,
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// A handle on one workspace directory.
///
/// Holds the log plus the projection derived from it (store and graph)
/// and keeps all three consistent through every mutation.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    config: EffectiveConfig,
    log: EventLog,
    store: Store,
    graph: DepGraph,
    // Mutex only to make `Workspace: Sync` despite the non-Sync SQLite
    // handle; every access is through `&mut self`, so it is never contended.
    snapshot: Option<Mutex<Snapshot>>,
    cursor: Cursor,
}

impl Workspace {
    /// Open the workspace rooted at `root` with default options, creating
    /// the data directory and an empty log on first use.
    ///
    /// # Errors
    ///
    /// See [`OpenOptions::open`].
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        OpenOptions::new().open(root)
    }

    fn open_with(root: PathBuf, options: OpenOptions) -> Result<Self> {
        let config =
            config::resolve_config(&root, options.actor.as_deref()).map_err(|err| {
                Error::Storage {
                    context: "load workspace configuration".to_string(),
                    source: Some(err.into()),
                }
            })?;

        let data_dir = root.join(DATA_DIR);
        std::fs::create_dir_all(&data_dir)?;
        let log = EventLog::open(data_dir.join(LOG_FILE))?;

        let snapshot = if options.no_cache {
            None
        } else {
            match Snapshot::open(data_dir.join(SNAPSHOT_FILE)) {
                Ok(snapshot) => Some(Mutex::new(snapshot)),
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot cache unavailable, running without it");
                    None
                }
            }
        };

        let mut workspace = Self {
            root,
            config,
            log,
            store: Store::new(),
            graph: DepGraph::new(),
            snapshot,
            cursor: Cursor {
                position: 0,
                last_record_id: None,
            },
        };
        workspace.load()?;
        Ok(workspace)
    }

    fn load(&mut self) -> Result<()> {
        if let Some(stats) = self.try_warm_start() {
            tracing::debug!(
                tail = stats.applied,
                skipped = stats.skipped,
                "warm start from snapshot cache"
            );
            return Ok(());
        }
        self.rebuild()?;
        Ok(())
    }

    /// Restore the projection from the snapshot cache and replay only the
    /// tail. `None` means the cache is absent, empty, unreadable, or pinned
    /// to a log that no longer matches; the caller replays from zero.
    fn try_warm_start(&mut self) -> Option<ReplayStats> {
        let (cursor, anchored, store, edges) = {
            let snapshot = self
                .snapshot
                .as_mut()?
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner);
            let cursor = match snapshot.cursor() {
                Ok(Some(cursor)) => cursor,
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot cursor unreadable, replaying from zero");
                    return None;
                }
            };
            if cursor.position == 0 {
                return None;
            }
            let anchored = match self.log.read_from(cursor.position - 1) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(error = %err, "log unreadable during warm start");
                    return None;
                }
            };
            // The record just before the cursor must still be there with
            // the same identity, or the log is not the one the snapshot
            // saw.
            let anchor = anchored.first()?;
            if anchor.position + 1 != cursor.position
                || Some(anchor.id.as_str()) != cursor.last_record_id.as_deref()
            {
                tracing::debug!("snapshot cursor does not match the log, replaying from zero");
                return None;
            }
            let (store, edges) = match snapshot.load() {
                Ok(parts) => parts,
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot rows unreadable, replaying from zero");
                    return None;
                }
            };
            (cursor, anchored, store, edges)
        };

        self.store = store;
        self.graph = DepGraph::from_edges_unchecked(&edges);
        self.cursor = cursor;
        let stats = self.replay(&anchored[1..]);
        if stats.applied > 0 || stats.skipped > 0 {
            self.persist_snapshot();
        }
        Some(stats)
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Drop the projection and replay the whole log.
    ///
    /// Records that fail to apply are skipped with a warning rather than
    /// failing the rebuild; the log is the source of truth even when parts
    /// of it have gone stale (references to purged issues, edges withheld
    /// by a later merge).
    ///
    /// # Errors
    ///
    /// Fails only when the log itself cannot be read.
    pub fn rebuild(&mut self) -> Result<ReplayStats> {
        let entries = self.log.read_all()?;
        self.store.clear();
        self.graph = DepGraph::new();
        self.cursor = Cursor {
            position: 0,
            last_record_id: None,
        };
        let stats = self.replay(&entries);
        self.persist_snapshot();
        tracing::debug!(
            applied = stats.applied,
            skipped = stats.skipped,
            "rebuilt projection from the log"
        );
        Ok(stats)
    }

    fn replay(&mut self, entries: &[LogEntry]) -> ReplayStats {
        let mut stats = ReplayStats::default();
        for entry in entries {
            match self.apply_record(&entry.record) {
                Ok(()) => stats.applied += 1,
                Err(err) => {
                    stats.skipped += 1;
                    tracing::warn!(
                        position = entry.position,
                        kind = entry.record.type_name(),
                        error = %err,
                        "skipping record during replay"
                    );
                }
            }
            self.cursor = Cursor {
                position: entry.position + 1,
                last_record_id: Some(entry.id.to_string()),
            };
        }
        stats
    }

    /// Apply one record to store and graph, then settle derived statuses
    /// for the issues it could have affected.
    fn apply_record(&mut self, record: &Record) -> Result<()> {
        match &record.body {
            RecordBody::Create { issue } => {
                self.store.apply(record)?;
                self.graph.ensure_node(&issue.id);
                self.recompute_derived(&[issue.id.clone()]);
            }
            RecordBody::Update { issue } => {
                self.store.apply(record)?;
                self.recompute_derived(&[issue.id.clone()]);
            }
            RecordBody::Close { id, .. } | RecordBody::Reopen { id } => {
                self.store.apply(record)?;
                let mut touched = vec![id.clone()];
                touched.extend(self.graph.dependents_of(id));
                self.recompute_derived(&touched);
            }
            RecordBody::Delete { id } => {
                self.store.apply(record)?;
                let dependents = self.graph.dependents_of(id);
                self.graph.detach(id);
                self.recompute_derived(&dependents);
            }
            RecordBody::Purge { id } => {
                self.store.apply(record)?;
                let dependents = self.graph.dependents_of(id);
                self.graph.remove_node(id);
                self.recompute_derived(&dependents);
            }
            RecordBody::Comment { .. } | RecordBody::Conflict { .. } => {
                self.store.apply(record)?;
            }
            RecordBody::DepAdd { dependency } => {
                // Graph first: a cycle-closing edge from a rewritten or
                // hand-edited log must leave nothing half applied.
                self.graph.add_edge(dependency)?;
                self.store.apply(record)?;
                self.recompute_derived(&[dependency.target.clone()]);
            }
            RecordBody::DepRemove { dependency } => {
                self.graph.remove_edge(dependency);
                self.store.apply(record)?;
                self.recompute_derived(&[dependency.target.clone()]);
            }
        }
        Ok(())
    }

    /// Re-derive `blocked` for each seed issue from its current blockers.
    ///
    /// An issue whose last open blocker went away resumes as
    /// `in_progress`; `blocked` is never written by a client, so entering
    /// and leaving it is this function's job alone. Closed and deleted
    /// issues are left untouched.
    fn recompute_derived(&mut self, seeds: &[IssueId]) {
        for id in seeds {
            let Some(issue) = self.store.issues().get(id) else {
                continue;
            };
            if !issue.is_live() {
                continue;
            }
            let current = issue.status;
            if self.graph.has_open_blocker(id, self.store.issues()) {
                self.store.set_derived_status(id, Status::Blocked);
            } else if current == Status::Blocked {
                self.store.set_derived_status(id, Status::InProgress);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Append one record and apply it, folding in anything another writer
    /// appended since this handle last looked at the log.
    fn commit(&mut self, record: Record) -> Result<()> {
        let id = RecordId::of(&record).map_err(|e| Error::storage("hash record", e))?;
        let position = self.log.append(&record)?;
        if position > self.cursor.position {
            self.catch_up(position)?;
        }
        // The record is on disk at this point; an apply failure leaves it
        // for the next replay to skip.
        self.apply_record(&record)?;
        self.cursor = Cursor {
            position: position + 1,
            last_record_id: Some(id.to_string()),
        };
        self.persist_snapshot();
        Ok(())
    }

    /// Replay foreign records sitting between our cursor and `before`.
    fn catch_up(&mut self, before: u64) -> Result<()> {
        let entries = self.log.read_from(self.cursor.position)?;
        let foreign: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| entry.position < before)
            .collect();
        if foreign.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            count = foreign.len(),
            "replaying records appended by another writer"
        );
        self.replay(&foreign);
        Ok(())
    }

    /// Save the projection to the snapshot cache. Best effort: the cache
    /// is disposable, so a failed save only warns.
    fn persist_snapshot(&mut self) {
        let edges = self.graph.all_edges();
        let Some(snapshot) = self.snapshot.as_mut() else {
            return;
        };
        let snapshot = snapshot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = snapshot.save(&self.store, &edges, &self.cursor) {
            tracing::warn!(error = %err, "snapshot cache save failed, continuing");
        }
    }

    /// Fold in records other writers appended since this handle last
    /// looked. Detects a rewritten log and rebuilds from zero.
    ///
    /// # Errors
    ///
    /// Fails when the log cannot be read.
    pub fn refresh(&mut self) -> Result<RefreshOutcome> {
        if self.cursor.position == 0 {
            let entries = self.log.read_all()?;
            if entries.is_empty() {
                return Ok(RefreshOutcome::Clean);
            }
            let stats = self.replay(&entries);
            self.persist_snapshot();
            return Ok(RefreshOutcome::CaughtUp(stats.applied));
        }

        let anchored = self.log.read_from(self.cursor.position - 1)?;
        let anchor_matches = anchored.first().is_some_and(|entry| {
            entry.position + 1 == self.cursor.position
                && Some(entry.id.as_str()) == self.cursor.last_record_id.as_deref()
        });
        if !anchor_matches {
            tracing::warn!("event log was rewritten underneath this handle, rebuilding");
            self.rebuild()?;
            return Ok(RefreshOutcome::Rebuilt);
        }

        let tail = &anchored[1..];
        if tail.is_empty() {
            return Ok(RefreshOutcome::Clean);
        }
        let stats = self.replay(tail);
        self.persist_snapshot();
        Ok(RefreshOutcome::CaughtUp(stats.applied))
    }

    // -----------------------------------------------------------------------
    // Issue operations
    // -----------------------------------------------------------------------

    /// Create an issue from a draft and return it as materialized.
    ///
    /// # Errors
    ///
    /// Fails on a blank title or when the append fails.
    pub fn create_issue(&mut self, draft: IssueDraft) -> Result<Issue> {
        let title = draft.title.trim().to_string();
        if title.is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        let now = now_micros();
        let id = self.derive_id(&title, now);

        let mut issue = Issue::new(id.clone(), title, now);
        issue.description = draft.description;
        issue.kind = draft.kind;
        issue.priority = draft.priority;
        issue.assignee = draft.assignee;
        issue.labels = draft.labels;

        let actor = self.config.actor.clone();
        self.commit(Record::new(now, actor, RecordBody::Create { issue }))?;
        self.expect_issue(&id)
    }

    /// Apply a partial update. Only the fields the patch sets change.
    ///
    /// # Errors
    ///
    /// Fails when the issue is missing, the patch is empty, or it requests
    /// a status move the lifecycle does not allow (`closed` takes a close
    /// record, `blocked` is derived).
    pub fn update_issue(&mut self, patch: IssuePatch) -> Result<Issue> {
        let current = self.require_visible(&patch.id)?.status;
        if let Some(target) = patch.status {
            current
                .can_transition_to(target)
                .map_err(|err| Error::validation(err.to_string()))?;
        }
        let id = patch.id.clone();
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::Update { issue: patch },
        ))?;
        self.expect_issue(&id)
    }

    /// Close an issue. Closing an already-closed issue moves its
    /// `closed_at` forward, nothing else.
    ///
    /// # Errors
    ///
    /// Fails when the issue is missing or deleted.
    pub fn close_issue(&mut self, id: &IssueId) -> Result<Issue> {
        self.require_visible(id)?;
        let now = now_micros();
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now,
            actor,
            RecordBody::Close {
                id: id.clone(),
                closed_at: now,
            },
        ))?;
        self.expect_issue(id)
    }

    /// Reopen an issue. Always permitted on a visible issue.
    ///
    /// # Errors
    ///
    /// Fails when the issue is missing or deleted.
    pub fn reopen_issue(&mut self, id: &IssueId) -> Result<Issue> {
        self.require_visible(id)?;
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::Reopen { id: id.clone() },
        ))?;
        self.expect_issue(id)
    }

    /// Soft-delete: hide the issue from default queries and detach its
    /// edges, releasing anything it blocked.
    ///
    /// # Errors
    ///
    /// Fails when the issue is missing or already deleted.
    pub fn delete_issue(&mut self, id: &IssueId) -> Result<()> {
        self.require_visible(id)?;
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::Delete { id: id.clone() },
        ))
    }

    /// Hard-delete: drop the issue, its comments, and its edges from the
    /// projection for good. The records remain in the log.
    ///
    /// # Errors
    ///
    /// Fails when the issue does not exist at all (soft-deleted is fine).
    pub fn purge_issue(&mut self, id: &IssueId) -> Result<()> {
        if self.store.get(id, true).is_none() {
            return Err(Error::not_found("issue", id.as_str()));
        }
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::Purge { id: id.clone() },
        ))
    }

    /// Append a comment and return it as materialized.
    ///
    /// # Errors
    ///
    /// Fails when the issue is missing or the text is blank.
    pub fn add_comment(&mut self, id: &IssueId, text: &str) -> Result<Comment> {
        self.require_visible(id)?;
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::Comment {
                comment: CommentPayload {
                    issue: id.clone(),
                    text: text.to_string(),
                },
            },
        ))?;
        self.store
            .comments_for(id)
            .last()
            .cloned()
            .ok_or_else(|| Error::storage_msg("comment did not materialize"))
    }

    // -----------------------------------------------------------------------
    // Dependency operations
    // -----------------------------------------------------------------------

    /// Add a dependency edge between two existing issues.
    ///
    /// # Errors
    ///
    /// Fails on a self-edge, a missing endpoint, a duplicate edge, or a
    /// `blocks` edge that would close a cycle. A rejected edge is never
    /// appended.
    pub fn add_dependency(&mut self, edge: DepEdge) -> Result<()> {
        if edge.is_self_edge() {
            return Err(Error::validation(format!(
                "{} cannot depend on itself",
                edge.source
            )));
        }
        self.require_visible(&edge.source)?;
        self.require_visible(&edge.target)?;
        if self.graph.contains_edge(&edge) {
            return Err(Error::validation(format!(
                "dependency already exists: {edge}"
            )));
        }
        self.graph.check_edge(&edge)?;

        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::DepAdd { dependency: edge },
        ))
    }

    /// Remove a dependency edge.
    ///
    /// # Errors
    ///
    /// Fails when the edge is not present.
    pub fn remove_dependency(&mut self, edge: DepEdge) -> Result<()> {
        if !self.graph.contains_edge(&edge) {
            return Err(Error::not_found("dependency", edge.to_string()));
        }
        let actor = self.config.actor.clone();
        self.commit(Record::new(
            now_micros(),
            actor,
            RecordBody::DepRemove { dependency: edge },
        ))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Fetch one issue. Soft-deleted issues are hidden unless asked for.
    #[must_use]
    pub fn issue(&self, id: &IssueId, include_deleted: bool) -> Option<&Issue> {
        self.store.get(id, include_deleted)
    }

    /// List issues matching a filter, sorted and paginated.
    #[must_use]
    pub fn list(&self, filter: &IssueFilter) -> Vec<&Issue> {
        self.store.list(filter)
    }

    /// Full-text search over titles, descriptions, and comments.
    #[must_use]
    pub fn search(&self, text: &str) -> Vec<&Issue> {
        self.store.search(text)
    }

    /// Comments for one issue, in append order.
    #[must_use]
    pub fn comments_for(&self, id: &IssueId) -> &[Comment] {
        self.store.comments_for(id)
    }

    /// All edges touching one issue, any kind.
    #[must_use]
    pub fn edges_of(&self, id: &IssueId) -> Vec<DepEdge> {
        self.graph.edges_of(id)
    }

    /// Live issues with no open blocker, most urgent first.
    #[must_use]
    pub fn ready(&self) -> Vec<&Issue> {
        self.resolve(&self.graph.ready_set(self.store.issues()))
    }

    /// Live issues waiting on at least one open blocker.
    #[must_use]
    pub fn blocked(&self) -> Vec<&Issue> {
        self.resolve(&self.graph.blocked_set(self.store.issues()))
    }

    /// Conflict notes left by reconciliations, oldest first.
    #[must_use]
    pub fn conflicts(&self) -> &[ConflictNote] {
        self.store.conflicts()
    }

    /// Cycles in the `blocks` subgraph. Empty in any workspace that only
    /// ever mutated through this API.
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<IssueId>> {
        self.graph.cycles()
    }

    /// A work order over all issues consistent with every `blocks` edge.
    ///
    /// # Errors
    ///
    /// Fails with the trapped cycle if the graph is not a DAG.
    pub fn topological_order(&self) -> Result<Vec<IssueId>> {
        Ok(self.graph.topological_order(self.store.issues())?)
    }

    /// Summary counts for status displays.
    #[must_use]
    pub fn status(&self) -> WorkspaceStatus {
        WorkspaceStatus {
            root: self.root.clone(),
            actor: self.config.actor.clone(),
            issues: self.store.status_counts(),
            ready: self.graph.ready_set(self.store.issues()).len(),
            blocked: self.graph.blocked_set(self.store.issues()).len(),
            edges: self.graph.edge_count(),
            conflicts: self.store.conflicts().len(),
            log_records: self.cursor.position,
        }
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.config.actor
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Records this handle has applied from the log.
    #[must_use]
    pub const fn log_position(&self) -> u64 {
        self.cursor.position
    }

    /// Remote log path from the workspace config, if one is set.
    #[must_use]
    pub fn remote(&self) -> Option<&Path> {
        self.config.remote.as_deref()
    }

    /// Configured background sync interval.
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        self.config.sync_interval
    }

    fn resolve(&self, ids: &[IssueId]) -> Vec<&Issue> {
        ids.iter()
            .filter_map(|id| self.store.issues().get(id))
            .collect()
    }

    fn require_visible(&self, id: &IssueId) -> Result<&Issue> {
        self.store
            .get(id, false)
            .ok_or_else(|| Error::not_found("issue", id.as_str()))
    }

    fn expect_issue(&self, id: &IssueId) -> Result<Issue> {
        self.store
            .get(id, true)
            .cloned()
            .ok_or_else(|| Error::not_found("issue", id.as_str()))
    }

    /// Derive a fresh id, bumping the disambiguator past any collision
    /// with an issue this workspace already holds.
    fn derive_id(&self, title: &str, created_at: i64) -> IssueId {
        let mut disambiguator = 0;
        loop {
            let id = IssueId::derive(title, created_at, &self.config.actor, disambiguator);
            if self.store.get(&id, true).is_none() {
                return id;
            }
            tracing::debug!(id = %id, "derived id collides with an existing issue");
            disambiguator += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Merge a remote log into this workspace's log.
    ///
    /// On divergence the local log is rewritten to the merged sequence and
    /// the projection rebuilt. The remote file is never written.
    ///
    /// # Errors
    ///
    /// Fails when the remote log does not exist or either log cannot be
    /// read, or the local log cannot be rewritten.
    pub fn pull(&mut self, remote: &Path) -> Result<SyncReport> {
        if !remote.exists() {
            return Err(Error::not_found("remote log", remote.display().to_string()));
        }
        let remote_log = EventLog::open(remote)?;
        self.reconcile_with(remote_log, false)
    }

    /// Merge both directions: after a push, the local and remote logs hold
    /// the same merged sequence. Creates the remote file on first push.
    ///
    /// # Errors
    ///
    /// Fails when either log cannot be read or rewritten.
    pub fn push(&mut self, remote: &Path) -> Result<SyncReport> {
        let remote_log = EventLog::open(remote)?;
        self.reconcile_with(remote_log, true)
    }

    fn reconcile_with(&mut self, mut remote_log: EventLog, write_remote: bool) -> Result<SyncReport> {
        let theirs = remote_log.read_all()?;
        let ours = self.log.read_all()?;
        let report = reconcile::merge(&ours, &theirs);

        let local_stale = !entries_match(&ours, &report.records);
        if local_stale {
            self.log.rewrite(&report.records)?;
            self.rebuild()?;
        }
        let remote_stale = write_remote && !entries_match(&theirs, &report.records);
        if remote_stale {
            remote_log.rewrite(&report.records)?;
        }

        tracing::info!(
            remote = %remote_log.path().display(),
            records = report.records.len(),
            superseded = report.superseded.len(),
            withheld = report.withheld.len(),
            clean = report.outcome.is_clean(),
            "reconciled with remote log"
        );
        Ok(SyncReport {
            outcome: report.outcome,
            records: report.records.len(),
            superseded: report.superseded.len(),
            withheld: report.withheld.len(),
            changed: local_stale || remote_stale,
        })
    }
}

/// Whether a log already holds exactly this record sequence.
fn entries_match(entries: &[LogEntry], records: &[Record]) -> bool {
    entries.len() == records.len()
        && entries
            .iter()
            .zip(records)
            .all(|(entry, record)| entry.record == *record)
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{
        DATA_DIR, IssueDraft, OpenOptions, RefreshOutcome, Workspace, entries_match,
    };
    use crate::error::ErrorCode;
    use crate::model::dependency::{DepEdge, DepKind};
    use crate::model::issue::{Issue, Priority, Status};
    use crate::model::issue_id::IssueId;
    use crate::record::log::LOG_FILE;
    use crate::record::{EventLog, IssuePatch};
    use crate::store::IssueFilter;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn open_as(dir: &TempDir, actor: &str) -> Workspace {
        OpenOptions::new().actor(actor).open(dir.path()).unwrap()
    }

    fn open_ws(dir: &TempDir) -> Workspace {
        open_as(dir, "tester")
    }

    fn draft(title: &str) -> IssueDraft {
        IssueDraft {
            title: title.to_string(),
            ..IssueDraft::default()
        }
    }

    fn log_file(dir: &TempDir) -> PathBuf {
        dir.path().join(DATA_DIR).join(LOG_FILE)
    }

    /// Seed a second workspace with a copy of the first one's log, as if
    /// both sides had synced once and then diverged.
    fn fork_workspace(src: &TempDir, dst: &TempDir) {
        std::fs::create_dir_all(dst.path().join(DATA_DIR)).unwrap();
        std::fs::copy(log_file(src), log_file(dst)).unwrap();
    }

    fn all_issues(ws: &Workspace) -> Vec<Issue> {
        let filter = IssueFilter {
            include_deleted: true,
            ..IssueFilter::default()
        };
        ws.list(&filter).into_iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Open and create
    // -----------------------------------------------------------------------

    #[test]
    fn open_initializes_the_data_dir() {
        let dir = TempDir::new().unwrap();
        let ws = open_ws(&dir);

        assert!(log_file(&dir).exists());
        assert_eq!(ws.log_position(), 0);
        assert!(ws.status().issues.is_empty());
        assert!(ws.ready().is_empty());
        assert_eq!(ws.actor(), "tester");
    }

    #[test]
    fn create_then_get_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);

        let created = ws
            .create_issue(IssueDraft {
                title: "  Fix websocket flake  ".to_string(),
                description: "Fails one run in five.".to_string(),
                priority: Priority::HIGHEST,
                assignee: Some("alice".to_string()),
                labels: ["ci".to_string()].into(),
                ..IssueDraft::default()
            })
            .unwrap();

        assert!(created.id.as_str().starts_with("br-"));
        assert_eq!(created.title, "Fix websocket flake", "title is trimmed");
        assert_eq!(created.status, Status::Open);

        let fetched = ws.issue(&created.id, false).unwrap();
        assert_eq!(*fetched, created);
        assert_eq!(ws.log_position(), 1);
    }

    #[test]
    fn create_rejects_blank_titles_without_appending() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);

        let err = ws.create_issue(draft("   ")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert_eq!(ws.log_position(), 0);
    }

    #[test]
    fn identical_drafts_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);

        let first = ws.create_issue(draft("same words")).unwrap();
        let second = ws.create_issue(draft("same words")).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(ws.status().issues.get("open"), Some(&2));
    }

    // -----------------------------------------------------------------------
    // Update and lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn update_patches_only_named_fields() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let issue = ws.create_issue(draft("patch me")).unwrap();

        let mut patch = IssuePatch::empty(issue.id.clone());
        patch.priority = Some(Priority::HIGHEST);
        patch.assignee = Some(Some("bob".to_string()));
        let updated = ws.update_issue(patch).unwrap();

        assert_eq!(updated.title, "patch me");
        assert_eq!(updated.priority, Priority::HIGHEST);
        assert_eq!(updated.assignee.as_deref(), Some("bob"));
        assert!(updated.updated_at >= issue.updated_at);
    }

    #[test]
    fn update_cannot_close_or_block_directly() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let issue = ws.create_issue(draft("strict lifecycle")).unwrap();

        let mut patch = IssuePatch::empty(issue.id.clone());
        patch.status = Some(Status::Closed);
        let err = ws.update_issue(patch).unwrap_err();
        assert!(err.to_string().contains("close record"), "{err}");

        let mut patch = IssuePatch::empty(issue.id.clone());
        patch.status = Some(Status::Blocked);
        assert!(ws.update_issue(patch).is_err());

        // Starting work is the one direct move.
        let mut patch = IssuePatch::empty(issue.id);
        patch.status = Some(Status::InProgress);
        assert_eq!(
            ws.update_issue(patch).unwrap().status,
            Status::InProgress
        );
    }

    #[test]
    fn update_of_missing_issue_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);

        let patch = IssuePatch {
            title: Some("ghost".to_string()),
            ..IssuePatch::empty(IssueId::derive("ghost", 1, "tester", 0))
        };
        assert_eq!(ws.update_issue(patch).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn close_and_reopen_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let issue = ws.create_issue(draft("lifecycle")).unwrap();

        let closed = ws.close_issue(&issue.id).unwrap();
        assert_eq!(closed.status, Status::Closed);
        assert!(closed.closed_at.is_some());

        let reopened = ws.reopen_issue(&issue.id).unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert_eq!(reopened.closed_at, None);
    }

    #[test]
    fn comments_attach_to_their_issue() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let issue = ws.create_issue(draft("talky")).unwrap();

        let comment = ws.add_comment(&issue.id, "root cause found").unwrap();
        assert_eq!(comment.author, "tester");
        assert_eq!(comment.text, "root cause found");
        assert_eq!(ws.comments_for(&issue.id).len(), 1);

        let err = ws.add_comment(&issue.id, "   ").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert_eq!(ws.comments_for(&issue.id).len(), 1);

        let hits = ws.search("cause");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, issue.id);
    }

    // -----------------------------------------------------------------------
    // Dependencies and derived status
    // -----------------------------------------------------------------------

    fn blocks(source: &Issue, target: &Issue) -> DepEdge {
        DepEdge::new(source.id.clone(), target.id.clone(), DepKind::Blocks)
    }

    #[test]
    fn blocking_edge_derives_blocked_status() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("unblocked work")).unwrap();
        let b = ws.create_issue(draft("waiting work")).unwrap();

        ws.add_dependency(blocks(&a, &b)).unwrap();

        assert_eq!(ws.issue(&b.id, false).unwrap().status, Status::Blocked);
        let ready: Vec<&IssueId> = ws.ready().iter().map(|i| &i.id).collect();
        assert_eq!(ready, vec![&a.id]);
        let blocked: Vec<&IssueId> = ws.blocked().iter().map(|i| &i.id).collect();
        assert_eq!(blocked, vec![&b.id]);
    }

    #[test]
    fn closing_the_last_blocker_resumes_work() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("first")).unwrap();
        let b = ws.create_issue(draft("second")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();

        ws.close_issue(&a.id).unwrap();
        assert_eq!(
            ws.issue(&b.id, false).unwrap().status,
            Status::InProgress,
            "unblocked work resumes, it does not go back to open"
        );
        assert!(ws.blocked().is_empty());

        ws.reopen_issue(&a.id).unwrap();
        assert_eq!(ws.issue(&b.id, false).unwrap().status, Status::Blocked);
    }

    #[test]
    fn cycle_closing_edge_is_rejected_before_the_log() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("a")).unwrap();
        let b = ws.create_issue(draft("b")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();
        let before = ws.log_position();

        let err = ws.add_dependency(blocks(&b, &a)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CycleDetected);
        assert_eq!(ws.log_position(), before, "rejected edge never hits disk");
        assert!(ws.cycles().is_empty());

        // A cold replay agrees: the log holds no trace of the attempt.
        drop(ws);
        let ws = OpenOptions::new()
            .actor("tester")
            .no_cache()
            .open(dir.path())
            .unwrap();
        assert!(ws.cycles().is_empty());
        assert_eq!(ws.log_position(), before);
    }

    #[test]
    fn duplicate_and_self_dependencies_are_invalid() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("a")).unwrap();
        let b = ws.create_issue(draft("b")).unwrap();

        ws.add_dependency(blocks(&a, &b)).unwrap();
        let err = ws.add_dependency(blocks(&a, &b)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err = ws.add_dependency(blocks(&a, &a)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn dependency_endpoints_must_exist() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("a")).unwrap();
        let ghost = IssueId::derive("ghost", 1, "tester", 0);

        let err = ws
            .add_dependency(DepEdge::new(a.id.clone(), ghost, DepKind::Blocks))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn removing_a_dependency_unblocks() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("a")).unwrap();
        let b = ws.create_issue(draft("b")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();

        ws.remove_dependency(blocks(&a, &b)).unwrap();
        assert_eq!(ws.issue(&b.id, false).unwrap().status, Status::InProgress);
        assert!(ws.edges_of(&a.id).is_empty());

        let err = ws.remove_dependency(blocks(&a, &b)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn delete_hides_and_releases_dependents() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("doomed")).unwrap();
        let b = ws.create_issue(draft("survivor")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();

        ws.delete_issue(&a.id).unwrap();

        assert!(ws.issue(&a.id, false).is_none());
        assert!(ws.issue(&a.id, true).unwrap().deleted_at.is_some());
        assert_eq!(ws.issue(&b.id, false).unwrap().status, Status::InProgress);
        assert!(ws.edges_of(&a.id).is_empty());

        let err = ws.delete_issue(&a.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound, "double delete");
    }

    #[test]
    fn purge_erases_from_the_projection() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("hard delete")).unwrap();
        let b = ws.create_issue(draft("downstream")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();
        ws.add_comment(&a.id, "about to vanish").unwrap();

        ws.purge_issue(&a.id).unwrap();

        assert!(ws.issue(&a.id, true).is_none());
        assert!(ws.comments_for(&a.id).is_empty());
        assert_eq!(ws.issue(&b.id, false).unwrap().status, Status::InProgress);
        assert_eq!(
            ws.purge_issue(&a.id).unwrap_err().code(),
            ErrorCode::NotFound
        );
    }

    // -----------------------------------------------------------------------
    // Persistence: warm starts, cold replays, torn logs
    // -----------------------------------------------------------------------

    #[test]
    fn restart_rebuilds_identical_state() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("kept open")).unwrap();
        let b = ws.create_issue(draft("kept closed")).unwrap();
        let c = ws.create_issue(draft("kept deleted")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();
        ws.close_issue(&b.id).unwrap();
        ws.delete_issue(&c.id).unwrap();
        ws.add_comment(&a.id, "note").unwrap();

        let issues = all_issues(&ws);
        let status = ws.status();
        drop(ws);

        // Warm start through the snapshot cache.
        let warm = open_ws(&dir);
        assert_eq!(all_issues(&warm), issues);
        assert_eq!(warm.status(), status);
        drop(warm);

        // Cold replay without the cache lands on the same state.
        let cold = OpenOptions::new()
            .actor("tester")
            .no_cache()
            .open(dir.path())
            .unwrap();
        assert_eq!(all_issues(&cold), issues);
        assert_eq!(cold.status(), status);
    }

    #[test]
    fn warm_start_replays_the_tail_behind_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        ws.create_issue(draft("snapshotted")).unwrap();
        drop(ws);

        // Append through a cache-less handle so the snapshot stays behind.
        let mut stale = OpenOptions::new()
            .actor("tester")
            .no_cache()
            .open(dir.path())
            .unwrap();
        stale.create_issue(draft("tail only")).unwrap();
        drop(stale);

        let ws = open_ws(&dir);
        assert_eq!(ws.status().issues.get("open"), Some(&2));
        assert_eq!(ws.log_position(), 2);
    }

    #[test]
    fn torn_trailing_line_is_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        ws.create_issue(draft("survives the crash")).unwrap();
        drop(ws);

        let mut raw = std::fs::OpenOptions::new()
            .append(true)
            .open(log_file(&dir))
            .unwrap();
        raw.write_all(b"{\"ts\":99,\"actor\":\"x\",\"ty").unwrap();
        drop(raw);

        let mut ws = open_ws(&dir);
        assert_eq!(ws.status().issues.get("open"), Some(&1));
        ws.create_issue(draft("appends continue")).unwrap();
        assert_eq!(ws.status().issues.get("open"), Some(&2));
    }

    #[test]
    fn unknown_record_types_are_ignored() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        ws.create_issue(draft("known")).unwrap();
        drop(ws);

        let mut raw = std::fs::OpenOptions::new()
            .append(true)
            .open(log_file(&dir))
            .unwrap();
        raw.write_all(b"{\"ts\":1,\"actor\":\"future\",\"type\":\"archive\"}\n")
            .unwrap();
        drop(raw);

        let mut ws = OpenOptions::new()
            .actor("tester")
            .no_cache()
            .open(dir.path())
            .unwrap();
        assert_eq!(ws.status().issues.get("open"), Some(&1));
        ws.create_issue(draft("still writable")).unwrap();
        assert_eq!(ws.status().issues.get("open"), Some(&2));
    }

    // -----------------------------------------------------------------------
    // Concurrent handles
    // -----------------------------------------------------------------------

    #[test]
    fn refresh_folds_in_foreign_appends() {
        let dir = TempDir::new().unwrap();
        let mut first = open_ws(&dir);
        let mut second = open_as(&dir, "other");

        second.create_issue(draft("from the other handle")).unwrap();

        assert_eq!(first.refresh().unwrap(), RefreshOutcome::CaughtUp(1));
        assert_eq!(first.status().issues.get("open"), Some(&1));
        assert_eq!(first.refresh().unwrap(), RefreshOutcome::Clean);

        second.create_issue(draft("one more")).unwrap();
        assert_eq!(first.refresh().unwrap(), RefreshOutcome::CaughtUp(1));
        assert_eq!(first.status().issues.get("open"), Some(&2));
    }

    #[test]
    fn append_absorbs_interleaved_writers() {
        let dir = TempDir::new().unwrap();
        let mut first = open_ws(&dir);
        let mut second = open_as(&dir, "other");

        second.create_issue(draft("theirs")).unwrap();
        // No refresh: the append itself must notice the foreign record.
        first.create_issue(draft("ours")).unwrap();

        assert_eq!(first.status().issues.get("open"), Some(&2));
        assert_eq!(first.log_position(), 2);
    }

    #[test]
    fn refresh_detects_a_rewritten_log() {
        let remote_dir = TempDir::new().unwrap();
        let mut remote = open_as(&remote_dir, "abe");
        remote.create_issue(draft("remote work")).unwrap();

        let dir = TempDir::new().unwrap();
        let mut stale = open_as(&dir, "zed");
        stale.create_issue(draft("local work")).unwrap();

        // A second handle pulls, rewriting the log the stale handle knows.
        let mut syncer = open_as(&dir, "zed");
        let report = syncer.pull(&log_file(&remote_dir)).unwrap();
        assert!(report.changed);

        assert_eq!(stale.refresh().unwrap(), RefreshOutcome::Rebuilt);
        assert_eq!(stale.status().issues.get("open"), Some(&2));
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    #[test]
    fn pull_from_missing_remote_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let err = ws.pull(&dir.path().join("nowhere.jsonl")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn pull_unions_divergent_tails() {
        let dir_a = TempDir::new().unwrap();
        let mut a = open_as(&dir_a, "alice");
        a.create_issue(draft("shared history")).unwrap();

        let dir_b = TempDir::new().unwrap();
        fork_workspace(&dir_a, &dir_b);
        let mut b = open_as(&dir_b, "bob");

        a.create_issue(draft("from alice")).unwrap();
        b.create_issue(draft("from bob")).unwrap();

        let report = a.pull(&log_file(&dir_b)).unwrap();
        assert!(report.outcome.is_clean());
        assert!(report.changed);
        assert_eq!(report.records, 3);
        assert_eq!(a.status().issues.get("open"), Some(&3));

        // Pulling again is a no-op.
        let report = a.pull(&log_file(&dir_b)).unwrap();
        assert!(!report.changed);
    }

    #[test]
    fn pull_resolves_double_close_to_the_later_writer() {
        let dir_a = TempDir::new().unwrap();
        let mut a = open_as(&dir_a, "alice");
        let issue = a.create_issue(draft("closed on both sides")).unwrap();

        let dir_b = TempDir::new().unwrap();
        fork_workspace(&dir_a, &dir_b);
        let mut b = open_as(&dir_b, "bob");

        a.close_issue(&issue.id).unwrap();
        let b_closed = b.close_issue(&issue.id).unwrap().closed_at;

        let report = a.pull(&log_file(&dir_b)).unwrap();
        assert!(report.outcome.is_clean(), "double close is not a conflict");
        assert_eq!(report.superseded, 1, "the earlier close is dropped");
        assert_eq!(report.records, 2, "create plus the surviving close");

        let merged = a.issue(&issue.id, false).unwrap();
        assert_eq!(merged.status, Status::Closed);
        assert_eq!(merged.closed_at, b_closed, "later close wins");
        assert!(a.conflicts().is_empty());
    }

    #[test]
    fn pull_withholds_cycle_closing_edges() {
        let dir_a = TempDir::new().unwrap();
        let mut a = open_as(&dir_a, "alice");
        let x = a.create_issue(draft("task x")).unwrap();
        let y = a.create_issue(draft("task y")).unwrap();

        let dir_b = TempDir::new().unwrap();
        fork_workspace(&dir_a, &dir_b);
        let mut b = open_as(&dir_b, "bob");

        a.add_dependency(blocks(&x, &y)).unwrap();
        b.add_dependency(blocks(&y, &x)).unwrap();

        let report = a.pull(&log_file(&dir_b)).unwrap();
        assert!(!report.outcome.is_clean());
        assert_eq!(report.withheld, 2, "both contested edges are withheld");

        // The merged workspace is acyclic and unconstrained.
        assert!(a.cycles().is_empty());
        assert_eq!(a.ready().len(), 2);
        assert!(a.edges_of(&x.id).is_empty());
        assert!(a.edges_of(&y.id).is_empty());

        // One conflict note per asserting side.
        assert_eq!(a.conflicts().len(), 2);
    }

    #[test]
    fn push_mirrors_the_merged_log_to_the_remote() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        ws.create_issue(draft("to be shared")).unwrap();

        let remote_dir = TempDir::new().unwrap();
        let remote = remote_dir.path().join("shared.jsonl");

        let report = ws.push(&remote).unwrap();
        assert!(report.changed, "first push writes the remote");

        let mirrored = EventLog::open(&remote).unwrap().read_all().unwrap();
        let ours = EventLog::open(log_file(&dir)).unwrap().read_all().unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].record, ours[0].record);

        let report = ws.push(&remote).unwrap();
        assert!(!report.changed, "second push finds nothing new");
    }

    #[test]
    fn entries_match_compares_record_content() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        ws.create_issue(draft("compare me")).unwrap();

        let entries = EventLog::open(log_file(&dir)).unwrap().read_all().unwrap();
        let records: Vec<_> = entries.iter().map(|e| e.record.clone()).collect();
        assert!(entries_match(&entries, &records));
        assert!(!entries_match(&entries, &[]));
    }

    // -----------------------------------------------------------------------
    // Status summary
    // -----------------------------------------------------------------------

    #[test]
    fn status_counts_the_workspace() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_ws(&dir);
        let a = ws.create_issue(draft("ready work")).unwrap();
        let b = ws.create_issue(draft("waiting work")).unwrap();
        let c = ws.create_issue(draft("finished work")).unwrap();
        ws.add_dependency(blocks(&a, &b)).unwrap();
        ws.close_issue(&c.id).unwrap();

        let status = ws.status();
        assert_eq!(status.actor, "tester");
        assert_eq!(status.issues.get("open"), Some(&1));
        assert_eq!(status.issues.get("blocked"), Some(&1));
        assert_eq!(status.issues.get("closed"), Some(&1));
        assert_eq!(status.ready, 1);
        assert_eq!(status.blocked, 1);
        assert_eq!(status.edges, 1);
        assert_eq!(status.conflicts, 0);
        assert_eq!(status.log_records, 5);
    }
}
