//! Method routing: one request in, one response out.
//!
//! [`Daemon`] owns the registry plus the little bit of process state the
//! protocol exposes (start time, stop flag). Every method body is a thin
//! adapter: parse typed params, run the matching engine operation under
//! the right lock, shape the result into a JSON object. All policy lives
//! in the engine; all transport lives in the server.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use braid_core::model::dependency::{DepEdge, DepKind};
use braid_core::model::issue::{Kind, Priority};
use braid_core::model::issue_id::IssueId;
use braid_core::record::IssuePatch;
use braid_core::store::filter::IssueFilter;
use braid_core::{Error as CoreError, IssueDraft, OpenOptions};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{RpcError, RpcResult};
use crate::proto::{Request, Response};
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// Daemon state
// ---------------------------------------------------------------------------

/// Shared state behind every connection: the workspace registry and the
/// stop flag the accept loop polls.
pub struct Daemon {
    registry: Registry,
    started_at: DateTime<Utc>,
    started: Instant,
    stop: AtomicBool,
}

impl Daemon {
    #[must_use]
    pub fn new(options: OpenOptions) -> Self {
        Self {
            registry: Registry::new(options),
            started_at: Utc::now(),
            started: Instant::now(),
            stop: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Handle one request, mapping any failure onto the wire error shape.
    pub fn handle(&self, request: Request) -> Response {
        let id = request.id;
        let method = request.method;
        match self.dispatch(&method, request.params) {
            Ok(result) => Response::ok(id, result),
            Err(err) => {
                debug!(%method, error = %err, "request failed");
                Response::fail(id, &err)
            }
        }
    }

    fn dispatch(&self, method: &str, params: Value) -> RpcResult<Value> {
        match method {
            "issue.create" => {
                let p: CreateParams = parse(params)?;
                let draft = IssueDraft {
                    title: p.title,
                    description: p.description,
                    kind: p.kind,
                    priority: p.priority,
                    assignee: p.assignee,
                    labels: p.labels,
                };
                self.registry
                    .write(&p.workspace, |ws| field("issue", &ws.create_issue(draft)?))
            }
            "issue.update" => {
                let p: UpdateParams = parse(params)?;
                self.registry
                    .write(&p.workspace, |ws| field("issue", &ws.update_issue(p.patch)?))
            }
            "issue.get" => {
                let p: GetParams = parse(params)?;
                self.registry.read(&p.workspace, |ws| {
                    let issue = ws
                        .issue(&p.id, p.include_deleted)
                        .ok_or_else(|| CoreError::not_found("issue", p.id.to_string()))?;
                    let mut result = Map::new();
                    result.insert("issue".to_string(), serde_json::to_value(issue)?);
                    result.insert(
                        "comments".to_string(),
                        serde_json::to_value(ws.comments_for(&p.id))?,
                    );
                    Ok(Value::Object(result))
                })
            }
            "issue.list" => {
                let p: ListParams = parse(params)?;
                self.registry.read(&p.workspace, |ws| {
                    let issues = ws.list(&p.filter);
                    let mut result = Map::new();
                    result.insert("count".to_string(), Value::from(issues.len()));
                    result.insert("issues".to_string(), serde_json::to_value(issues)?);
                    Ok(Value::Object(result))
                })
            }
            "issue.close" => {
                let p: IdParams = parse(params)?;
                self.registry
                    .write(&p.workspace, |ws| field("issue", &ws.close_issue(&p.id)?))
            }
            "issue.reopen" => {
                let p: IdParams = parse(params)?;
                self.registry
                    .write(&p.workspace, |ws| field("issue", &ws.reopen_issue(&p.id)?))
            }
            "issue.delete" => {
                let p: IdParams = parse(params)?;
                self.registry.write(&p.workspace, |ws| {
                    ws.delete_issue(&p.id)?;
                    field("id", &p.id)
                })
            }
            "issue.comment" => {
                let p: CommentParams = parse(params)?;
                self.registry.write(&p.workspace, |ws| {
                    field("comment", &ws.add_comment(&p.id, &p.text)?)
                })
            }
            "dep.add" => {
                let p: DepParams = parse(params)?;
                let edge = DepEdge::new(p.source, p.target, p.kind);
                self.registry.write(&p.workspace, |ws| {
                    ws.add_dependency(edge.clone())?;
                    field("dependency", &edge)
                })
            }
            "dep.remove" => {
                let p: DepParams = parse(params)?;
                let edge = DepEdge::new(p.source, p.target, p.kind);
                self.registry.write(&p.workspace, |ws| {
                    ws.remove_dependency(edge.clone())?;
                    field("dependency", &edge)
                })
            }
            "sync.pull" => {
                let p: SyncParams = parse(params)?;
                self.registry.write(&p.workspace, |ws| {
                    let remote = resolve_remote(ws, p.remote)?;
                    Ok(serde_json::to_value(ws.pull(&remote)?)?)
                })
            }
            "sync.push" => {
                let p: SyncParams = parse(params)?;
                self.registry.write(&p.workspace, |ws| {
                    let remote = resolve_remote(ws, p.remote)?;
                    Ok(serde_json::to_value(ws.push(&remote)?)?)
                })
            }
            "workspace.rebuild" => {
                let p: WorkspaceParams = parse(params)?;
                let stats = self.registry.rebuild(&p.workspace)?;
                Ok(serde_json::to_value(stats)?)
            }
            "daemon.status" => {
                let p: StatusParams = parse(params)?;
                self.status(p.workspace.as_deref())
            }
            "daemon.stop" => {
                info!("stop requested");
                self.request_stop();
                let mut result = Map::new();
                result.insert("stopping".to_string(), Value::Bool(true));
                Ok(Value::Object(result))
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }

    fn status(&self, workspace: Option<&std::path::Path>) -> RpcResult<Value> {
        let mut result = Map::new();
        result.insert(
            "version".to_string(),
            Value::from(env!("CARGO_PKG_VERSION")),
        );
        result.insert(
            "started_at".to_string(),
            Value::from(self.started_at.to_rfc3339()),
        );
        result.insert(
            "uptime_secs".to_string(),
            Value::from(self.started.elapsed().as_secs()),
        );
        result.insert(
            "workspaces".to_string(),
            serde_json::to_value(self.registry.entries())?,
        );
        if let Some(root) = workspace {
            let status = self
                .registry
                .read(root, |ws| Ok(serde_json::to_value(ws.status())?));
            match status {
                Ok(status) => {
                    result.insert("workspace".to_string(), status);
                }
                Err(err @ RpcError::Unavailable { .. }) => {
                    let mut quarantined = Map::new();
                    quarantined.insert("quarantined".to_string(), Value::Bool(true));
                    quarantined.insert("reason".to_string(), Value::from(err.to_string()));
                    result.insert("workspace".to_string(), Value::Object(quarantined));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Value::Object(result))
    }
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// Parse method params, treating absent params as an empty object so
/// methods without required fields accept `"params": null`.
fn parse<T: DeserializeOwned>(params: Value) -> RpcResult<T> {
    let params = if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|err| RpcError::BadRequest(format!("params: {err}")))
}

/// Wrap a single serialized value in a one-field result object.
fn field<T: serde::Serialize>(key: &str, value: &T) -> RpcResult<Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(Value::Object(map))
}

fn resolve_remote(
    ws: &braid_core::Workspace,
    requested: Option<PathBuf>,
) -> Result<PathBuf, CoreError> {
    match requested {
        Some(path) => Ok(path),
        None => ws
            .remote()
            .map(std::path::Path::to_path_buf)
            .ok_or_else(|| CoreError::validation("no remote configured for this workspace")),
    }
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    workspace: PathBuf,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    kind: Kind,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    labels: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    workspace: PathBuf,
    #[serde(flatten)]
    patch: IssuePatch,
}

#[derive(Debug, Deserialize)]
struct GetParams {
    workspace: PathBuf,
    id: IssueId,
    #[serde(default)]
    include_deleted: bool,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    workspace: PathBuf,
    #[serde(flatten)]
    filter: IssueFilter,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    workspace: PathBuf,
    id: IssueId,
}

#[derive(Debug, Deserialize)]
struct CommentParams {
    workspace: PathBuf,
    id: IssueId,
    text: String,
}

#[derive(Debug, Deserialize)]
struct DepParams {
    workspace: PathBuf,
    source: IssueId,
    target: IssueId,
    #[serde(default = "default_dep_kind")]
    kind: DepKind,
}

const fn default_dep_kind() -> DepKind {
    DepKind::Blocks
}

#[derive(Debug, Deserialize)]
struct SyncParams {
    workspace: PathBuf,
    #[serde(default)]
    remote: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceParams {
    workspace: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    #[serde(default)]
    workspace: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn daemon() -> Daemon {
        Daemon::new(OpenOptions::new().actor("dispatch-tests"))
    }

    fn call(daemon: &Daemon, method: &str, params: Value) -> Response {
        daemon.handle(Request::new(1, method, params))
    }

    fn result(response: Response) -> Value {
        response.into_result().expect("ok response")
    }

    fn error_code(response: Response) -> String {
        response.into_result().expect_err("error response").code
    }

    // -- routing ------------------------------------------------------------

    #[test]
    fn create_get_list_route_through_the_engine() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let root = dir.path().to_string_lossy().to_string();

        let created = result(call(
            &daemon,
            "issue.create",
            json!({
                "workspace": root,
                "title": "wire up the frontend",
                "kind": "feature",
                "priority": 1,
                "labels": ["web"],
            }),
        ));
        let id = created["issue"]["id"].as_str().expect("issue id").to_string();
        assert!(id.starts_with("br-"));
        assert_eq!(created["issue"]["status"], "open");

        let fetched = result(call(
            &daemon,
            "issue.get",
            json!({ "workspace": root, "id": id }),
        ));
        assert_eq!(fetched["issue"]["title"], "wire up the frontend");
        assert_eq!(fetched["comments"], json!([]));

        let listed = result(call(
            &daemon,
            "issue.list",
            json!({ "workspace": root, "kind": "feature" }),
        ));
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["issues"][0]["id"], id.as_str());
    }

    #[test]
    fn update_flattens_the_patch() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let root = dir.path().to_string_lossy().to_string();

        let created = result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": root, "title": "retitle me" }),
        ));
        let id = created["issue"]["id"].as_str().expect("issue id").to_string();

        let updated = result(call(
            &daemon,
            "issue.update",
            json!({
                "workspace": root,
                "id": id,
                "title": "retitled",
                "assignee": "sam",
            }),
        ));
        assert_eq!(updated["issue"]["title"], "retitled");
        assert_eq!(updated["issue"]["assignee"], "sam");
    }

    #[test]
    fn dependencies_default_to_blocks() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let root = dir.path().to_string_lossy().to_string();

        let a = result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": root, "title": "first" }),
        ))["issue"]["id"]
            .as_str()
            .expect("id")
            .to_string();
        let b = result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": root, "title": "second" }),
        ))["issue"]["id"]
            .as_str()
            .expect("id")
            .to_string();

        let added = result(call(
            &daemon,
            "dep.add",
            json!({ "workspace": root, "source": a, "target": b }),
        ));
        assert_eq!(added["dependency"]["kind"], "blocks");

        let blocked = result(call(
            &daemon,
            "issue.get",
            json!({ "workspace": root, "id": b }),
        ));
        assert_eq!(blocked["issue"]["status"], "blocked");

        let code = error_code(call(
            &daemon,
            "dep.add",
            json!({ "workspace": root, "source": b, "target": a }),
        ));
        assert_eq!(code, "E2001");
    }

    // -- request surface ----------------------------------------------------

    #[test]
    fn unknown_methods_and_bad_params_map_to_wire_codes() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let root = dir.path().to_string_lossy().to_string();

        assert_eq!(
            error_code(call(&daemon, "issue.zap", json!({ "workspace": root }))),
            "E5002"
        );
        assert_eq!(
            error_code(call(&daemon, "issue.create", json!({ "workspace": root }))),
            "E5001",
            "missing title is a params error"
        );
        assert_eq!(
            error_code(call(&daemon, "issue.create", Value::Null)),
            "E5001"
        );
    }

    #[test]
    fn status_reports_process_and_workspace_state() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let root = dir.path().to_string_lossy().to_string();

        result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": root, "title": "tracked" }),
        ));

        let status = result(call(&daemon, "daemon.status", Value::Null));
        assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
        assert!(status["uptime_secs"].is_u64());
        assert_eq!(status["workspaces"][0]["state"], "active");

        let scoped = result(call(
            &daemon,
            "daemon.status",
            json!({ "workspace": root }),
        ));
        assert_eq!(scoped["workspace"]["issues"]["open"], 1);
    }

    #[test]
    fn stop_flips_the_flag_and_acknowledges() {
        let daemon = daemon();
        assert!(!daemon.stop_requested());
        let ack = result(call(&daemon, "daemon.stop", Value::Null));
        assert_eq!(ack["stopping"], true);
        assert!(daemon.stop_requested());
    }

    #[test]
    fn sync_without_a_remote_is_a_validation_error() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let root = dir.path().to_string_lossy().to_string();

        result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": root, "title": "lonely" }),
        ));
        assert_eq!(
            error_code(call(&daemon, "sync.pull", json!({ "workspace": root }))),
            "E1001"
        );
    }

    #[test]
    fn pull_from_an_explicit_remote_merges_histories() {
        let local = TempDir::new().expect("tempdir");
        let remote = TempDir::new().expect("tempdir");
        let daemon = daemon();
        let local_root = local.path().to_string_lossy().to_string();
        let remote_root = remote.path().to_string_lossy().to_string();

        result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": local_root, "title": "ours" }),
        ));
        result(call(
            &daemon,
            "issue.create",
            json!({ "workspace": remote_root, "title": "theirs" }),
        ));

        let report = result(call(
            &daemon,
            "sync.pull",
            json!({
                "workspace": local_root,
                "remote": remote.path().join(".braid/issues.jsonl"),
            }),
        ));
        assert_eq!(report["outcome"]["result"], "merged");
        assert_eq!(report["records"], 2);

        let listed = result(call(
            &daemon,
            "issue.list",
            json!({ "workspace": local_root }),
        ));
        assert_eq!(listed["count"], 2);
    }
}
