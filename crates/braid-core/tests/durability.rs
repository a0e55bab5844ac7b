//! Durability of a shared `.braid/` directory under faults and
//! concurrent writers.
//!
//! Covers the failure modes the workspace is built to absorb:
//! - warm (cached) and cold (full replay) opens landing on the same state
//! - a torn final line after a mid-append crash
//! - a snapshot cache that is missing, corrupt, or pinned to a gone log
//! - threads interleaving appends through the advisory lock
//! - genuinely malformed log lines failing loudly instead of silently

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use braid_core::ErrorCode;
use braid_core::model::dependency::{DepEdge, DepKind};
use braid_core::model::issue::{Issue, Priority, Status};
use braid_core::model::issue_id::IssueId;
use braid_core::record::IssuePatch;
use braid_core::record::log::LOG_FILE;
use braid_core::store::IssueFilter;
use braid_core::store::snapshot::SNAPSHOT_FILE;
use braid_core::workspace::{DATA_DIR, IssueDraft, OpenOptions, Workspace};
use tempfile::TempDir;

fn open_as(dir: &TempDir, actor: &str) -> Workspace {
    OpenOptions::new()
        .actor(actor)
        .open(dir.path())
        .expect("open workspace")
}

fn open_cold(dir: &TempDir) -> Workspace {
    OpenOptions::new()
        .actor("tester")
        .no_cache()
        .open(dir.path())
        .expect("open workspace without cache")
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

fn blocks(source: &Issue, target: &Issue) -> DepEdge {
    DepEdge::new(source.id.clone(), target.id.clone(), DepKind::Blocks)
}

fn log_file(dir: &TempDir) -> PathBuf {
    dir.path().join(DATA_DIR).join(LOG_FILE)
}

fn cache_file(dir: &TempDir) -> PathBuf {
    dir.path().join(DATA_DIR).join(SNAPSHOT_FILE)
}

fn all_issues(ws: &Workspace) -> Vec<Issue> {
    let filter = IssueFilter {
        include_deleted: true,
        ..IssueFilter::default()
    };
    ws.list(&filter).into_iter().cloned().collect()
}

fn ready_ids(ws: &Workspace) -> Vec<IssueId> {
    ws.ready().iter().map(|issue| issue.id.clone()).collect()
}

// ---------------------------------------------------------------------------
// Restart equivalence
// ---------------------------------------------------------------------------

#[test]
fn mixed_history_survives_warm_and_cold_restarts() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_ws(&dir);

    let gate = ws
        .create_issue(IssueDraft {
            title: "schema migration".to_string(),
            description: "drop the legacy orders table".to_string(),
            priority: Priority::HIGHEST,
            assignee: Some("alice".to_string()),
            labels: ["backend".to_string()].into(),
            ..IssueDraft::default()
        })
        .expect("create gate");
    let api = ws.create_issue(draft("api endpoint")).expect("create api");
    let ui = ws.create_issue(draft("frontend wire-up")).expect("create ui");
    let noise = ws.create_issue(draft("flaky test in ci")).expect("create noise");
    let gone = ws.create_issue(draft("will be purged")).expect("create gone");

    ws.add_dependency(blocks(&gate, &api)).expect("gate blocks api");
    ws.add_dependency(blocks(&api, &ui)).expect("api blocks ui");
    ws.add_dependency(DepEdge::new(
        noise.id.clone(),
        api.id.clone(),
        DepKind::DiscoveredFrom,
    ))
    .expect("noise discovered from api");
    ws.add_comment(&gate.id, "blocked on the dba review").expect("comment");

    let mut patch = IssuePatch::empty(api.id.clone());
    patch.priority = Some(Priority::new(1).expect("priority 1 is valid"));
    ws.update_issue(patch).expect("bump api priority");

    ws.close_issue(&gate.id).expect("close gate");
    ws.reopen_issue(&gate.id).expect("reopen gate");
    ws.close_issue(&gate.id).expect("close gate again");
    ws.delete_issue(&noise.id).expect("soft delete noise");
    ws.purge_issue(&gone.id).expect("purge gone");
    ws.remove_dependency(blocks(&api, &ui)).expect("unchain ui");

    let issues = all_issues(&ws);
    let status = ws.status();
    let ready = ready_ids(&ws);
    assert_eq!(status.log_records, 16, "fixture writes sixteen records");
    drop(ws);

    let warm = open_ws(&dir);
    assert_eq!(all_issues(&warm), issues);
    assert_eq!(warm.status(), status);
    assert_eq!(ready_ids(&warm), ready);
    assert!(warm.issue(&gone.id, true).is_none(), "purged stays purged");
    assert_eq!(
        warm.comments_for(&gate.id).len(),
        1,
        "comments ride along in the snapshot"
    );
    drop(warm);

    let cold = open_cold(&dir);
    assert_eq!(all_issues(&cold), issues);
    assert_eq!(cold.status(), status);
    assert_eq!(ready_ids(&cold), ready);
    assert_eq!(
        cold.issue(&api.id, false).expect("api survives").status,
        Status::InProgress,
        "closing the gate released api on every replay path"
    );
}

#[test]
fn rebuild_is_idempotent() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_ws(&dir);
    let a = ws.create_issue(draft("one")).expect("create");
    let b = ws.create_issue(draft("two")).expect("create");
    ws.add_dependency(blocks(&a, &b)).expect("dep");
    ws.close_issue(&a.id).expect("close");

    let before = all_issues(&ws);
    let first = ws.rebuild().expect("first rebuild");
    assert_eq!(first.applied, 4);
    assert_eq!(first.skipped, 0);
    assert_eq!(all_issues(&ws), before);

    let second = ws.rebuild().expect("second rebuild");
    assert_eq!(second, first);
    assert_eq!(all_issues(&ws), before);
    assert_eq!(ws.log_position(), 4);
}

// ---------------------------------------------------------------------------
// Snapshot cache faults
// ---------------------------------------------------------------------------

#[test]
fn deleted_snapshot_cache_is_rebuilt_on_open() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_ws(&dir);
    let a = ws.create_issue(draft("kept")).expect("create");
    ws.create_issue(draft("also kept")).expect("create");
    ws.close_issue(&a.id).expect("close");
    drop(ws);

    let cache = cache_file(&dir);
    assert!(cache.exists(), "a cached open leaves a snapshot behind");
    fs::remove_file(&cache).expect("drop the cache");

    let ws = open_ws(&dir);
    assert_eq!(ws.status().issues.get("open"), Some(&1));
    assert_eq!(ws.status().issues.get("closed"), Some(&1));
    assert!(cache.exists(), "the open rewrites the cache from the log");
}

#[test]
fn corrupt_snapshot_cache_falls_back_to_the_log() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_ws(&dir);
    ws.create_issue(draft("first")).expect("create");
    ws.create_issue(draft("second")).expect("create");
    drop(ws);

    fs::write(cache_file(&dir), b"these bytes are not a database").expect("clobber the cache");

    let mut ws = open_ws(&dir);
    assert_eq!(ws.status().issues.get("open"), Some(&2));
    // The workspace keeps working without its cache.
    ws.create_issue(draft("third")).expect("create past the bad cache");
    assert_eq!(ws.status().issues.get("open"), Some(&3));
}

#[test]
fn log_removal_empties_the_workspace_despite_the_cache() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_ws(&dir);
    ws.create_issue(draft("cached content")).expect("create");
    ws.create_issue(draft("more cached content")).expect("create");
    drop(ws);

    fs::remove_file(log_file(&dir)).expect("lose the log");

    let ws = open_ws(&dir);
    assert!(
        ws.status().issues.is_empty(),
        "a cache with no matching log counts for nothing"
    );
    assert_eq!(ws.log_position(), 0);
}

// ---------------------------------------------------------------------------
// Log faults
// ---------------------------------------------------------------------------

#[test]
fn torn_tail_is_repaired_in_place_on_open() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_cold(&dir);
    for n in 0..3 {
        ws.create_issue(draft(&format!("complete record {n}")))
            .expect("create");
    }
    drop(ws);

    let mut raw = fs::OpenOptions::new()
        .append(true)
        .open(log_file(&dir))
        .expect("open log for fault injection");
    raw.write_all(b"{\"ts\":123456,\"actor\":\"crashed\",\"type\":\"cre")
        .expect("append partial line");
    drop(raw);

    let mut ws = open_cold(&dir);
    assert_eq!(ws.status().issues.get("open"), Some(&3));
    ws.create_issue(draft("appended after repair")).expect("create");
    drop(ws);

    let content = fs::read_to_string(log_file(&dir)).expect("read repaired log");
    assert!(content.ends_with('\n'), "log ends at a full-line boundary");
    assert_eq!(
        content.lines().count(),
        4,
        "torn bytes are gone and the new record sits on its own line"
    );
    assert!(!content.contains("crashed"), "no trace of the torn write");
}

#[test]
fn garbage_middle_line_fails_the_open_loudly() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_cold(&dir);
    ws.create_issue(draft("good record")).expect("create");
    drop(ws);

    let mut raw = fs::OpenOptions::new()
        .append(true)
        .open(log_file(&dir))
        .expect("open log for fault injection");
    // Newline-terminated, so torn-tail repair leaves it alone.
    raw.write_all(b"{\"ts\":oops}\n").expect("append garbage line");
    raw.write_all(b"# trailing comment keeps the garbage mid-file\n")
        .expect("append comment line");
    drop(raw);

    let err = OpenOptions::new()
        .actor("tester")
        .no_cache()
        .open(dir.path())
        .expect_err("corrupt JSON must not be skipped");
    assert_eq!(err.code(), ErrorCode::StorageFailed);
    assert!(err.to_string().contains(LOG_FILE), "message was: {err}");
}

#[test]
fn comment_and_blank_lines_are_tolerated() {
    let dir = TempDir::new().expect("create temp dir");
    let mut ws = open_cold(&dir);
    ws.create_issue(draft("annotated")).expect("create");
    drop(ws);

    let mut raw = fs::OpenOptions::new()
        .append(true)
        .open(log_file(&dir))
        .expect("open log for annotation");
    raw.write_all(b"# hand-written note from an operator\n\n")
        .expect("append comment and blank");
    drop(raw);

    let mut ws = open_cold(&dir);
    assert_eq!(ws.status().issues.get("open"), Some(&1));
    assert_eq!(ws.log_position(), 1, "annotations do not consume positions");
    ws.create_issue(draft("after the note")).expect("create");
    assert_eq!(ws.log_position(), 2);
}

// ---------------------------------------------------------------------------
// Concurrent writers
// ---------------------------------------------------------------------------

#[test]
fn threads_interleave_appends_without_loss() {
    let dir = TempDir::new().expect("create temp dir");
    drop(open_ws(&dir));

    std::thread::scope(|scope| {
        for writer in 0..4 {
            let root = dir.path();
            scope.spawn(move || {
                let mut ws = OpenOptions::new()
                    .actor(format!("writer-{writer}"))
                    .no_cache()
                    .open(root)
                    .expect("open per-thread handle");
                for n in 0..5 {
                    ws.create_issue(draft(&format!("writer {writer} task {n}")))
                        .expect("concurrent create");
                }
            });
        }
    });

    let ws = open_as(&dir, "verify");
    assert_eq!(ws.log_position(), 20);
    assert_eq!(ws.status().issues.get("open"), Some(&20));

    let titles: BTreeSet<String> = ws
        .list(&IssueFilter::default())
        .iter()
        .map(|issue| issue.title.clone())
        .collect();
    assert_eq!(titles.len(), 20, "every concurrent create survives");
}

#[test]
fn interleaved_handles_converge_without_explicit_refresh() {
    let dir = TempDir::new().expect("create temp dir");
    let mut first = open_as(&dir, "first");
    let mut second = open_as(&dir, "second");

    let a = first.create_issue(draft("from first")).expect("create");
    let b = second.create_issue(draft("from second")).expect("create");
    // This append folds b in, which makes it a legal edge endpoint for
    // the call after it. No handle ever called refresh.
    first.create_issue(draft("also from first")).expect("create");
    first
        .add_dependency(DepEdge::new(a.id.clone(), b.id.clone(), DepKind::Blocks))
        .expect("edge across both writers' issues");

    assert_eq!(first.status().issues.get("open"), Some(&2));
    assert_eq!(first.status().issues.get("blocked"), Some(&1));

    second.refresh().expect("second catches up");
    assert_eq!(
        second.issue(&b.id, false).expect("b visible").status,
        Status::Blocked,
        "both handles agree on the derived status"
    );
    assert_eq!(second.log_position(), first.log_position());
}
