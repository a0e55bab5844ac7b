//! Materialized issue store.
//!
//! [`Store`] holds the current state derived from the event log: issues,
//! comments, conflict notes, and the secondary indexes behind listing and
//! search. [`Store::apply`] is the only mutator driven by records, so the
//! store's content is always a pure function of the record sequence it has
//! seen. Replaying the same log into a fresh store reproduces it exactly,
//! which is what the rebuild path and the snapshot cache lean on.
//!
//! # Indexes
//!
//! Issues are indexed by status, assignee, label, and search token (title,
//! description, and comment words). Indexes keep soft-deleted issues;
//! filters hide them unless asked not to. [`Store::list`] uses the
//! narrowest available index to seed candidates and then applies the full
//! filter.
//!
//! ## Submodules
//!
//! - [`filter`]: filter and sort criteria for listings
//! - [`snapshot`]: `SQLite` cache so warm starts skip full replay

pub mod filter;
pub mod snapshot;

pub use filter::{IssueFilter, SortOrder};
pub use snapshot::{Cursor, Snapshot};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::dependency::DepEdge;
use crate::model::issue::{Issue, Status};
use crate::model::issue_id::IssueId;
use crate::record::{CommentPayload, ConflictSide, IssuePatch, Record, RecordBody};

// ---------------------------------------------------------------------------
// Derived rows
// ---------------------------------------------------------------------------

/// A comment attached to an issue, with envelope metadata flattened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
    pub at: i64,
}

/// An operator-visible note left behind by a reconciliation that had to
/// withhold a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictNote {
    pub at: i64,
    pub actor: String,
    pub side: ConflictSide,
    pub edge: DepEdge,
    pub note: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory projection of the event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Store {
    issues: BTreeMap<IssueId, Issue>,
    comments: BTreeMap<IssueId, Vec<Comment>>,
    conflicts: Vec<ConflictNote>,
    by_status: HashMap<Status, BTreeSet<IssueId>>,
    by_assignee: HashMap<String, BTreeSet<IssueId>>,
    by_label: HashMap<String, BTreeSet<IssueId>>,
    by_token: HashMap<String, BTreeSet<IssueId>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from already-materialized rows, re-deriving every
    /// index. The snapshot cache loads through here.
    pub(crate) fn from_parts(
        issues: impl IntoIterator<Item = Issue>,
        comments: BTreeMap<IssueId, Vec<Comment>>,
        conflicts: Vec<ConflictNote>,
    ) -> Self {
        let mut store = Self {
            comments,
            conflicts,
            ..Self::default()
        };
        for issue in issues {
            store.index_issue(&issue);
            store.issues.insert(issue.id.clone(), issue);
        }
        store
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Apply one record to the projection.
    ///
    /// Records that reference an issue the store does not hold fail with
    /// `NotFound`; the replay layer decides whether that aborts or is
    /// logged and skipped. Duplicate creates keep the first issue.
    pub fn apply(&mut self, record: &Record) -> Result<()> {
        match &record.body {
            RecordBody::Create { issue } => self.apply_create(issue),
            RecordBody::Update { issue } => self.apply_update(issue, record.ts),
            RecordBody::Close { id, closed_at } => self.apply_close(id, *closed_at, record.ts),
            RecordBody::Reopen { id } => self.apply_reopen(id, record.ts),
            RecordBody::Delete { id } => self.apply_delete(id, record.ts),
            RecordBody::Purge { id } => {
                self.apply_purge(id);
                Ok(())
            }
            RecordBody::Comment { comment } => self.apply_comment(comment, record),
            RecordBody::DepAdd { dependency } | RecordBody::DepRemove { dependency } => {
                self.touch_endpoints(dependency, record.ts);
                Ok(())
            }
            RecordBody::Conflict { conflict } => {
                self.conflicts.push(ConflictNote {
                    at: record.ts,
                    actor: record.actor.clone(),
                    side: conflict.side,
                    edge: conflict.dependency.clone(),
                    note: conflict.note.clone(),
                });
                Ok(())
            }
        }
    }

    fn apply_create(&mut self, issue: &Issue) -> Result<()> {
        if self.issues.contains_key(&issue.id) {
            tracing::debug!(id = %issue.id, "ignoring duplicate create");
            return Ok(());
        }
        self.index_issue(issue);
        self.issues.insert(issue.id.clone(), issue.clone());
        Ok(())
    }

    fn apply_update(&mut self, patch: &IssuePatch, ts: i64) -> Result<()> {
        let Some(mut issue) = self.issues.remove(&patch.id) else {
            return Err(Error::not_found("issue", patch.id.as_str()));
        };
        self.unindex_issue(&issue);

        if let Some(title) = &patch.title {
            issue.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            issue.description.clone_from(description);
        }
        if let Some(kind) = patch.kind {
            issue.kind = kind;
        }
        if let Some(status) = patch.status {
            issue.status = status;
        }
        if let Some(priority) = patch.priority {
            issue.priority = priority;
        }
        if let Some(assignee) = &patch.assignee {
            issue.assignee.clone_from(assignee);
        }
        if let Some(labels) = &patch.labels {
            issue.labels.clone_from(labels);
        }
        issue.updated_at = ts;

        self.index_issue(&issue);
        self.issues.insert(issue.id.clone(), issue);
        Ok(())
    }

    fn apply_close(&mut self, id: &IssueId, closed_at: i64, ts: i64) -> Result<()> {
        let Some(mut issue) = self.issues.remove(id) else {
            return Err(Error::not_found("issue", id.as_str()));
        };
        self.unindex_issue(&issue);
        // A close on an already-closed issue just moves closed_at: the
        // later record wins.
        issue.status = Status::Closed;
        issue.closed_at = Some(closed_at);
        issue.updated_at = ts;
        self.index_issue(&issue);
        self.issues.insert(issue.id.clone(), issue);
        Ok(())
    }

    fn apply_reopen(&mut self, id: &IssueId, ts: i64) -> Result<()> {
        let Some(mut issue) = self.issues.remove(id) else {
            return Err(Error::not_found("issue", id.as_str()));
        };
        self.unindex_issue(&issue);
        issue.status = Status::Open;
        issue.closed_at = None;
        issue.updated_at = ts;
        self.index_issue(&issue);
        self.issues.insert(issue.id.clone(), issue);
        Ok(())
    }

    fn apply_delete(&mut self, id: &IssueId, ts: i64) -> Result<()> {
        let Some(issue) = self.issues.get_mut(id) else {
            return Err(Error::not_found("issue", id.as_str()));
        };
        issue.deleted_at = Some(ts);
        issue.updated_at = ts;
        Ok(())
    }

    fn apply_purge(&mut self, id: &IssueId) {
        let Some(issue) = self.issues.remove(id) else {
            tracing::debug!(id = %id, "purge for an unknown issue");
            return;
        };
        self.unindex_issue(&issue);
        self.comments.remove(id);
    }

    fn apply_comment(&mut self, comment: &CommentPayload, record: &Record) -> Result<()> {
        let Some(issue) = self.issues.get_mut(&comment.issue) else {
            return Err(Error::not_found("issue", comment.issue.as_str()));
        };
        issue.updated_at = record.ts;
        self.comments
            .entry(comment.issue.clone())
            .or_default()
            .push(Comment {
                author: record.actor.clone(),
                text: comment.text.clone(),
                at: record.ts,
            });
        for token in filter::tokenize(&comment.text) {
            self.by_token
                .entry(token)
                .or_default()
                .insert(comment.issue.clone());
        }
        Ok(())
    }

    fn touch_endpoints(&mut self, edge: &DepEdge, ts: i64) {
        for id in [&edge.source, &edge.target] {
            if let Some(issue) = self.issues.get_mut(id) {
                issue.updated_at = ts;
            }
        }
    }

    /// Move an issue's status as dictated by its blockers, without
    /// treating it as an edit. Leaves `updated_at` alone so derived
    /// transitions never reshuffle recency listings. Returns whether the
    /// status actually changed.
    pub fn set_derived_status(&mut self, id: &IssueId, status: Status) -> bool {
        let Some(issue) = self.issues.get_mut(id) else {
            return false;
        };
        if issue.status == status {
            return false;
        }
        let previous = issue.status;
        issue.status = status;
        let id = issue.id.clone();
        Self::drop_from(&mut self.by_status, &previous, &id);
        self.by_status.entry(status).or_default().insert(id);
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Fetch one issue. Soft-deleted issues are hidden unless asked for.
    #[must_use]
    pub fn get(&self, id: &IssueId, include_deleted: bool) -> Option<&Issue> {
        self.issues
            .get(id)
            .filter(|issue| include_deleted || !issue.is_deleted())
    }

    /// List issues matching a filter, sorted, paginated.
    #[must_use]
    pub fn list(&self, filter: &IssueFilter) -> Vec<&Issue> {
        let admitted = |issue: &&Issue| filter.matches(issue, self.comments_for(&issue.id));
        let mut picked: Vec<&Issue> = match self.candidate_ids(filter) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.issues.get(id))
                .filter(admitted)
                .collect(),
            None => self.issues.values().filter(admitted).collect(),
        };
        picked.sort_by(|a, b| filter.sort.compare(a, b));

        let skipped = picked.into_iter().skip(filter.offset.unwrap_or(0));
        match filter.limit {
            Some(limit) => skipped.take(limit).collect(),
            None => skipped.collect(),
        }
    }

    /// Issues whose title, description, or comments contain every token of
    /// the query, in the default listing order.
    #[must_use]
    pub fn search(&self, text: &str) -> Vec<&Issue> {
        let filter = IssueFilter {
            text: Some(text.to_string()),
            ..IssueFilter::default()
        };
        self.list(&filter)
    }

    /// The narrowest index candidate set for a filter, if any indexed
    /// criterion is present. `matches` still re-checks everything.
    fn candidate_ids(&self, filter: &IssueFilter) -> Option<BTreeSet<IssueId>> {
        if let Some(assignee) = &filter.assignee {
            return Some(self.by_assignee.get(assignee).cloned().unwrap_or_default());
        }
        if let Some(label) = &filter.label {
            return Some(self.by_label.get(label).cloned().unwrap_or_default());
        }
        if let Some(text) = &filter.text {
            if let Some(token) = filter::tokenize(text).pop_first() {
                return Some(self.by_token.get(&token).cloned().unwrap_or_default());
            }
        }
        if let Some(status) = filter.status {
            return Some(self.by_status.get(&status).cloned().unwrap_or_default());
        }
        None
    }

    /// Comments for one issue in append order.
    #[must_use]
    pub fn comments_for(&self, id: &IssueId) -> &[Comment] {
        self.comments.get(id).map_or(&[], Vec::as_slice)
    }

    /// Conflict notes accumulated by reconciliations, oldest first.
    #[must_use]
    pub fn conflicts(&self) -> &[ConflictNote] {
        &self.conflicts
    }

    /// Full issue map, keyed by id. The dependency graph's scheduling
    /// queries take this directly.
    #[must_use]
    pub const fn issues(&self) -> &BTreeMap<IssueId, Issue> {
        &self.issues
    }

    /// Issue counts per status, excluding soft-deleted issues.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for issue in self.issues.values() {
            if !issue.is_deleted() {
                *counts.entry(issue.status.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Drop all state ahead of a full replay.
    pub fn clear(&mut self) {
        self.issues.clear();
        self.comments.clear();
        self.conflicts.clear();
        self.by_status.clear();
        self.by_assignee.clear();
        self.by_label.clear();
        self.by_token.clear();
    }

    // -----------------------------------------------------------------------
    // Index maintenance
    // -----------------------------------------------------------------------

    fn index_issue(&mut self, issue: &Issue) {
        let tokens = self.search_tokens(issue);
        let id = &issue.id;
        self.by_status
            .entry(issue.status)
            .or_default()
            .insert(id.clone());
        if let Some(assignee) = &issue.assignee {
            self.by_assignee
                .entry(assignee.clone())
                .or_default()
                .insert(id.clone());
        }
        for label in &issue.labels {
            self.by_label
                .entry(label.clone())
                .or_default()
                .insert(id.clone());
        }
        for token in tokens {
            self.by_token.entry(token).or_default().insert(id.clone());
        }
    }

    fn unindex_issue(&mut self, issue: &Issue) {
        let tokens = self.search_tokens(issue);
        let id = &issue.id;
        Self::drop_from(&mut self.by_status, &issue.status, id);
        if let Some(assignee) = &issue.assignee {
            Self::drop_from(&mut self.by_assignee, assignee, id);
        }
        for label in &issue.labels {
            Self::drop_from(&mut self.by_label, label, id);
        }
        for token in tokens {
            Self::drop_from(&mut self.by_token, &token, id);
        }
    }

    /// Tokens the issue should be findable by: title and description words
    /// plus every comment's words. Index and unindex both go through here
    /// so the two stay symmetric even when title and comments share words.
    fn search_tokens(&self, issue: &Issue) -> BTreeSet<String> {
        let mut tokens = filter::issue_tokens(issue);
        for comment in self.comments_for(&issue.id) {
            tokens.extend(filter::tokenize(&comment.text));
        }
        tokens
    }

    fn drop_from<K>(index: &mut HashMap<K, BTreeSet<IssueId>>, key: &K, id: &IssueId)
    where
        K: Eq + Hash,
    {
        if let Some(set) = index.get_mut(key) {
            set.remove(id);
            if set.is_empty() {
                index.remove(key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
