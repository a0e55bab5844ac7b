//! Merging two divergent event logs into one.
//!
//! Two clients appending to copies of the same log (or a version-control
//! merge of the log file) leave a shared prefix and two divergent tails.
//! [`merge`] folds those tails back into a single sequence:
//!
//! 1. the shared prefix passes through untouched;
//! 2. tail records are deduplicated by record identity and ordered by
//!    timestamp, then actor, then identity, so every replica computes the
//!    same sequence no matter which side ran the merge;
//! 3. a record whose touched fields are all re-touched by later records on
//!    the same issue is superseded: dropped from the merged log with an
//!    audit entry. Records touching disjoint fields both survive, and the
//!    replay order makes the later timestamp win any field both touch;
//! 4. the merged `blocks` edge set is probed for cycles. Edges that would
//!    close one are withheld and replaced by conflict-marker records, one
//!    per asserting side, for an actor to resolve with a follow-up record.
//!
//! The merge never touches a store; the caller rewrites the log with
//! [`MergeReport::records`] and rebuilds from it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::graph::DepGraph;
use crate::model::dependency::{DepEdge, DepKind};
use crate::model::issue_id::IssueId;
use crate::record::{ConflictMarker, ConflictSide, LogEntry, Record, RecordBody, RecordId};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// How a merge ended. Conflicted merges still produce a usable,
/// acyclic record sequence; the cycles name what was withheld and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    Conflicted { cycles: Vec<Vec<IssueId>> },
}

impl MergeOutcome {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Merged)
    }
}

/// Audit entry for a record dropped because every field it touched was
/// re-touched later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersession {
    pub issue: IssueId,
    pub fields: Vec<&'static str>,
    pub dropped_ts: i64,
    pub dropped_actor: String,
    pub kept_ts: i64,
    pub kept_actor: String,
}

/// Everything a merge produced: the merged record sequence plus the audit
/// trail of what was dropped or withheld along the way.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub records: Vec<Record>,
    pub superseded: Vec<Supersession>,
    pub withheld: Vec<DepEdge>,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

struct UnionEntry {
    id: RecordId,
    record: Record,
    from_local: bool,
    from_remote: bool,
}

/// Merge two logs that share a common prefix.
///
/// Pure on its inputs: no I/O, no store access, and deterministic in the
/// face of either argument order up to the `local`/`remote` labels on
/// conflict markers.
#[must_use]
pub fn merge(local: &[LogEntry], remote: &[LogEntry]) -> MergeReport {
    let prefix_len = common_prefix_len(local, remote);
    let entries = union_tails(&local[prefix_len..], &remote[prefix_len..]);

    let (keep, superseded) = supersede(&entries);

    let final_edges = surviving_edges(&local[..prefix_len], &entries, &keep);
    let graph = DepGraph::from_edges_unchecked(&final_edges);
    let cycles = graph.cycles();
    let contested = contested_edges(&entries, &keep, &final_edges, &cycles);

    let mut records: Vec<Record> = local[..prefix_len]
        .iter()
        .map(|entry| entry.record.clone())
        .collect();
    let mut markers: Vec<Record> = Vec::new();
    let mut withheld: Vec<DepEdge> = Vec::new();

    for (idx, entry) in entries.iter().enumerate() {
        if !keep[idx] {
            continue;
        }
        if let RecordBody::DepAdd { dependency } = &entry.record.body {
            if contested.contains(dependency) {
                tracing::warn!(
                    edge = %dependency,
                    actor = %entry.record.actor,
                    "withholding dependency that would close a cycle"
                );
                withheld.push(dependency.clone());
                markers.extend(markers_for(entry, dependency, &cycles));
                continue;
            }
        }
        records.push(entry.record.clone());
    }
    records.extend(markers);

    let outcome = if cycles.is_empty() {
        MergeOutcome::Merged
    } else {
        MergeOutcome::Conflicted { cycles }
    };

    MergeReport {
        outcome,
        records,
        superseded,
        withheld,
    }
}

/// Length of the shared prefix, compared by record identity so a log that
/// was rewritten since the fork cannot pass as an ancestor.
fn common_prefix_len(local: &[LogEntry], remote: &[LogEntry]) -> usize {
    local
        .iter()
        .zip(remote)
        .take_while(|(a, b)| a.id == b.id)
        .count()
}

/// Deduplicated union of both tails in merge order: timestamp, then
/// actor, then record identity. Actor order settles same-instant writes
/// and identity keeps the order total.
fn union_tails(local: &[LogEntry], remote: &[LogEntry]) -> Vec<UnionEntry> {
    let mut union: BTreeMap<RecordId, UnionEntry> = BTreeMap::new();
    for entry in local {
        union
            .entry(entry.id.clone())
            .or_insert_with(|| UnionEntry {
                id: entry.id.clone(),
                record: entry.record.clone(),
                from_local: false,
                from_remote: false,
            })
            .from_local = true;
    }
    for entry in remote {
        union
            .entry(entry.id.clone())
            .or_insert_with(|| UnionEntry {
                id: entry.id.clone(),
                record: entry.record.clone(),
                from_local: false,
                from_remote: false,
            })
            .from_remote = true;
    }

    let mut entries: Vec<UnionEntry> = union.into_values().collect();
    entries.sort_by(|a, b| {
        a.record
            .ts
            .cmp(&b.record.ts)
            .then_with(|| a.record.actor.cmp(&b.record.actor))
            .then_with(|| a.id.cmp(&b.id))
    });
    entries
}

/// The fields a record writes, for supersession purposes. Creates,
/// comments, and dependency records are identity-bearing rather than
/// field-bearing and never supersede or get superseded.
fn touched_fields(record: &Record) -> Option<(&IssueId, Vec<&'static str>)> {
    match &record.body {
        RecordBody::Update { issue } => Some((&issue.id, issue.fields())),
        RecordBody::Close { id, .. } | RecordBody::Reopen { id } => {
            Some((id, vec!["status", "closed_at"]))
        }
        RecordBody::Delete { id } => Some((id, vec!["deleted_at"])),
        _ => None,
    }
}

/// Mark fully-superseded records for dropping. Entries must already be in
/// merge order; a later index is a later write.
fn supersede(entries: &[UnionEntry]) -> (Vec<bool>, Vec<Supersession>) {
    let mut latest: HashMap<(&IssueId, &'static str), usize> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        if let Some((issue, fields)) = touched_fields(&entry.record) {
            for field in fields {
                latest.insert((issue, field), idx);
            }
        }
    }

    let mut keep = vec![true; entries.len()];
    let mut superseded = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let Some((issue, fields)) = touched_fields(&entry.record) else {
            continue;
        };
        let winners: Vec<usize> = fields.iter().map(|field| latest[&(issue, *field)]).collect();
        if winners.iter().any(|&winner| winner == idx) {
            continue;
        }
        let Some(&winner) = winners.iter().max() else {
            continue;
        };
        keep[idx] = false;
        let kept = &entries[winner].record;
        tracing::info!(
            issue = %issue,
            dropped_actor = %entry.record.actor,
            kept_actor = %kept.actor,
            fields = ?fields,
            "dropping fully superseded record"
        );
        superseded.push(Supersession {
            issue: issue.clone(),
            fields,
            dropped_ts: entry.record.ts,
            dropped_actor: entry.record.actor.clone(),
            kept_ts: kept.ts,
            kept_actor: kept.actor.clone(),
        });
    }
    (keep, superseded)
}

/// The edge set left standing after replaying prefix and kept tail
/// records: an add puts an edge in, a remove takes it out.
fn surviving_edges(
    prefix: &[LogEntry],
    entries: &[UnionEntry],
    keep: &[bool],
) -> BTreeSet<DepEdge> {
    let mut edges: BTreeSet<DepEdge> = BTreeSet::new();
    let prefix_records = prefix.iter().map(|entry| &entry.record);
    let tail_records = entries
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep[*idx])
        .map(|(_, entry)| &entry.record);
    for record in prefix_records.chain(tail_records) {
        match &record.body {
            RecordBody::DepAdd { dependency } => {
                edges.insert(dependency.clone());
            }
            RecordBody::DepRemove { dependency } => {
                edges.remove(dependency);
            }
            _ => {}
        }
    }
    edges
}

/// Which surviving `blocks` edges sit inside a detected cycle. Only these
/// get withheld; everything outside the cycles is safe to keep.
fn contested_edges(
    entries: &[UnionEntry],
    keep: &[bool],
    final_edges: &BTreeSet<DepEdge>,
    cycles: &[Vec<IssueId>],
) -> BTreeSet<DepEdge> {
    if cycles.is_empty() {
        return BTreeSet::new();
    }
    let members: Vec<HashSet<&IssueId>> = cycles
        .iter()
        .map(|cycle| cycle.iter().collect())
        .collect();

    let mut contested = BTreeSet::new();
    for (idx, entry) in entries.iter().enumerate() {
        if !keep[idx] {
            continue;
        }
        let RecordBody::DepAdd { dependency } = &entry.record.body else {
            continue;
        };
        if dependency.kind != DepKind::Blocks || !final_edges.contains(dependency) {
            continue;
        }
        if members
            .iter()
            .any(|cycle| cycle.contains(&dependency.source) && cycle.contains(&dependency.target))
        {
            contested.insert(dependency.clone());
        }
    }
    contested
}

/// Conflict markers for one withheld edge, one per side that asserted it.
fn markers_for(entry: &UnionEntry, edge: &DepEdge, cycles: &[Vec<IssueId>]) -> Vec<Record> {
    let note = cycles
        .iter()
        .find(|cycle| cycle.contains(&edge.source) && cycle.contains(&edge.target))
        .map_or_else(
            || "withheld to keep the blocks graph acyclic".to_string(),
            |cycle| {
                let names: Vec<&str> = cycle.iter().map(IssueId::as_str).collect();
                format!("withheld to keep the blocks graph acyclic; cycle among {}", names.join(", "))
            },
        );

    let mut sides = Vec::new();
    if entry.from_local {
        sides.push(ConflictSide::Local);
    }
    if entry.from_remote {
        sides.push(ConflictSide::Remote);
    }
    sides
        .into_iter()
        .map(|side| {
            Record::new(
                entry.record.ts,
                entry.record.actor.clone(),
                RecordBody::Conflict {
                    conflict: ConflictMarker {
                        side,
                        dependency: edge.clone(),
                        note: note.clone(),
                    },
                },
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
