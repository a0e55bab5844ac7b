//! Background sync task.
//!
//! One thread per daemon, not per workspace: every tick it sweeps the
//! registry and syncs the workspaces whose interval has elapsed. The
//! per-workspace work is `Workspace::refresh`, which covers both the
//! cheap case (another writer appended; catch up from the cursor) and
//! the divergent case (the log was rewritten; rebuild), plus a pull
//! when the workspace has a remote configured.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::dispatch::Daemon;

/// Granularity of the stop-flag and interval checks.
const TICK: Duration = Duration::from_millis(500);

/// Sweep until the daemon asks to stop.
pub(crate) fn run(daemon: &Daemon) {
    debug!("sync task started");
    while !daemon.stop_requested() {
        thread::sleep(TICK);
        if daemon.stop_requested() {
            break;
        }
        let pass = daemon.registry().sync_pass();
        if !pass.is_idle() {
            debug!(
                refreshed = pass.refreshed,
                pulled = pass.pulled,
                failed = pass.failed,
                "sync pass"
            );
        }
    }
    debug!("sync task stopped");
}
