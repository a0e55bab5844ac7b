//! Daemon-side ownership of workspaces.
//!
//! One [`Slot`] per canonical workspace root, created on first reference
//! and kept for the life of the daemon. Each slot holds its `Workspace`
//! behind a single-writer/multi-reader lock: reads run concurrently,
//! writes and the background sync pass are exclusive, and workspaces
//! never contend with each other.
//!
//! A slot that hits a storage fault is quarantined: it answers every
//! request with `E4002` until a rebuild succeeds. The projection is never
//! patched in place; recovery is always a fresh open plus a full replay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use braid_core::workspace::ReplayStats;
use braid_core::{Error as CoreError, ErrorCode, OpenOptions, Workspace};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All workspaces the daemon has touched, keyed by canonical root.
pub struct Registry {
    options: OpenOptions,
    slots: Mutex<BTreeMap<PathBuf, Arc<Slot>>>,
}

/// One row of `daemon.status` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceEntry {
    pub root: PathBuf,
    pub state: &'static str,
}

/// Counters from one background sync sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPass {
    /// Workspaces whose projection was checked against the log.
    pub refreshed: usize,
    /// Workspaces reconciled against their configured remote.
    pub pulled: usize,
    /// Workspaces whose sync attempt failed.
    pub failed: usize,
}

impl SyncPass {
    /// Whether the sweep did anything worth logging.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.refreshed == 0 && self.pulled == 0 && self.failed == 0
    }
}

impl Registry {
    #[must_use]
    pub fn new(options: OpenOptions) -> Self {
        Self {
            options,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run `f` against the workspace under the shared lock.
    ///
    /// Activates the workspace on first reference, which takes the
    /// exclusive lock once.
    ///
    /// # Errors
    ///
    /// Fails when the root cannot be resolved, activation fails, the
    /// workspace is quarantined, or `f` itself fails.
    pub fn read<T>(
        &self,
        root: &Path,
        f: impl FnOnce(&Workspace) -> RpcResult<T>,
    ) -> RpcResult<T> {
        let slot = self.slot(root)?;
        slot.ensure_active(&self.options)?;
        let state = slot.state.read().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            SlotState::Active(ws) => f(ws),
            SlotState::Quarantined(reason) => Err(RpcError::unavailable(reason.clone())),
            SlotState::Idle => Err(RpcError::unavailable("workspace is not active")),
        }
    }

    /// Run `f` against the workspace under the exclusive lock.
    ///
    /// A storage failure out of `f` quarantines the slot before the error
    /// propagates; every other error leaves the slot as it was.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Registry::read`].
    pub fn write<T>(
        &self,
        root: &Path,
        f: impl FnOnce(&mut Workspace) -> RpcResult<T>,
    ) -> RpcResult<T> {
        let slot = self.slot(root)?;
        slot.ensure_active(&self.options)?;
        let mut state = slot.state.write().unwrap_or_else(PoisonError::into_inner);
        let result = match &mut *state {
            SlotState::Active(ws) => f(ws),
            SlotState::Quarantined(reason) => return Err(RpcError::unavailable(reason.clone())),
            SlotState::Idle => return Err(RpcError::unavailable("workspace is not active")),
        };
        if let Err(RpcError::Core(core)) = &result {
            if core.code() == ErrorCode::StorageFailed {
                warn!(
                    root = %slot.root.display(),
                    error = %core,
                    "storage fault, quarantining workspace"
                );
                *state = SlotState::Quarantined(core.to_string());
            }
        }
        result
    }

    /// Reopen the workspace from scratch and replay the whole log.
    ///
    /// This is the only way out of quarantine. The old handle is dropped
    /// unconditionally so nothing from the faulted projection survives.
    ///
    /// # Errors
    ///
    /// Fails when the log still cannot be opened or replayed; the slot
    /// stays (or becomes) quarantined in that case.
    pub fn rebuild(&self, root: &Path) -> RpcResult<ReplayStats> {
        let slot = self.slot(root)?;
        let mut state = slot.state.write().unwrap_or_else(PoisonError::into_inner);
        let opened = self.options.clone().open(&slot.root).and_then(|mut ws| {
            let stats = ws.rebuild()?;
            Ok((ws, stats))
        });
        match opened {
            Ok((ws, stats)) => {
                info!(
                    root = %slot.root.display(),
                    applied = stats.applied,
                    skipped = stats.skipped,
                    "workspace rebuilt"
                );
                *state = SlotState::Active(Box::new(ws));
                slot.mark_synced();
                Ok(stats)
            }
            Err(err) => {
                if err.code() == ErrorCode::StorageFailed {
                    warn!(
                        root = %slot.root.display(),
                        error = %err,
                        "rebuild failed, workspace stays quarantined"
                    );
                    *state = SlotState::Quarantined(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Snapshot of every known slot for `daemon.status`.
    #[must_use]
    pub fn entries(&self) -> Vec<WorkspaceEntry> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .map(|slot| WorkspaceEntry {
                root: slot.root.clone(),
                state: slot.state_name(),
            })
            .collect()
    }

    /// One background sweep: refresh every active workspace whose sync
    /// interval has elapsed, then reconcile against its remote when one
    /// is configured. Slots busy with a request are skipped and caught
    /// on the next tick.
    #[must_use]
    pub fn sync_pass(&self) -> SyncPass {
        let slots: Vec<Arc<Slot>> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.values().cloned().collect()
        };
        let mut pass = SyncPass::default();
        for slot in slots {
            slot.sync_if_due(&mut pass);
        }
        pass
    }

    fn slot(&self, root: &Path) -> RpcResult<Arc<Slot>> {
        let canonical = std::fs::canonicalize(root).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found("workspace", root.display().to_string())
            } else {
                CoreError::storage(format!("resolve workspace {}", root.display()), err)
            }
        })?;
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(canonical)
            .or_insert_with_key(|canonical| Arc::new(Slot::new(canonical.clone())));
        Ok(Arc::clone(slot))
    }
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

struct Slot {
    root: PathBuf,
    state: RwLock<SlotState>,
    synced_at: Mutex<Instant>,
}

enum SlotState {
    /// Known but not yet opened.
    Idle,
    /// Live handle serving requests.
    Active(Box<Workspace>),
    /// A storage fault poisoned the handle; only a rebuild restores it.
    Quarantined(String),
}

impl Slot {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            state: RwLock::new(SlotState::Idle),
            synced_at: Mutex::new(Instant::now()),
        }
    }

    /// Open the workspace on first touch. A storage failure here already
    /// quarantines the slot so later requests fail fast with `E4002`
    /// instead of re-running the failing open.
    fn ensure_active(&self, options: &OpenOptions) -> RpcResult<()> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*state, SlotState::Idle) {
                return Ok(());
            }
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, SlotState::Idle) {
            match options.clone().open(&self.root) {
                Ok(ws) => {
                    info!(root = %self.root.display(), "workspace activated");
                    *state = SlotState::Active(Box::new(ws));
                    self.mark_synced();
                }
                Err(err) => {
                    if err.code() == ErrorCode::StorageFailed {
                        warn!(
                            root = %self.root.display(),
                            error = %err,
                            "activation failed, quarantining workspace"
                        );
                        *state = SlotState::Quarantined(err.to_string());
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn state_name(&self) -> &'static str {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            SlotState::Idle => "idle",
            SlotState::Active(_) => "active",
            SlotState::Quarantined(_) => "quarantined",
        }
    }

    fn mark_synced(&self) {
        *self.synced_at.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn sync_due(&self, interval: std::time::Duration) -> bool {
        let synced_at = self.synced_at.lock().unwrap_or_else(PoisonError::into_inner);
        synced_at.elapsed() >= interval
    }

    fn sync_if_due(&self, pass: &mut SyncPass) {
        let Ok(mut state) = self.state.try_write() else {
            return;
        };
        let mut poison = None;
        if let SlotState::Active(ws) = &mut *state {
            if !self.sync_due(ws.sync_interval()) {
                return;
            }
            match ws.refresh() {
                Ok(outcome) => {
                    pass.refreshed += 1;
                    debug!(root = %self.root.display(), ?outcome, "sync refresh");
                }
                Err(err) => {
                    pass.failed += 1;
                    warn!(root = %self.root.display(), error = %err, "background refresh failed");
                    if err.code() == ErrorCode::StorageFailed {
                        poison = Some(err.to_string());
                    }
                }
            }
            if poison.is_none() {
                if let Some(remote) = ws.remote().map(Path::to_path_buf) {
                    match ws.pull(&remote) {
                        Ok(report) => {
                            pass.pulled += 1;
                            if report.changed {
                                info!(
                                    root = %self.root.display(),
                                    records = report.records,
                                    withheld = report.withheld,
                                    "pulled remote changes"
                                );
                            } else {
                                debug!(root = %self.root.display(), "remote already merged");
                            }
                        }
                        Err(err) => {
                            pass.failed += 1;
                            warn!(
                                root = %self.root.display(),
                                error = %err,
                                "background pull failed"
                            );
                            if err.code() == ErrorCode::StorageFailed {
                                poison = Some(err.to_string());
                            }
                        }
                    }
                }
            }
            self.mark_synced();
        }
        if let Some(reason) = poison {
            warn!(root = %self.root.display(), "storage fault, quarantining workspace");
            *state = SlotState::Quarantined(reason);
        }
    }
}
