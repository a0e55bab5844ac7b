//! Workspace and user configuration.
//!
//! Two TOML files, both optional: `.braid/config.toml` inside the
//! workspace and `braid/config.toml` under the platform config directory.
//! Workspace values override user values, and every field has a default,
//! so a missing file is never an error. [`resolve_config`] folds both
//! files plus explicit overrides into one [`EffectiveConfig`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-workspace configuration, read from `.braid/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Actor id stamped on records written from this workspace.
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Background reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Path of a remote copy of the event log to reconcile against.
    #[serde(default)]
    pub remote: Option<PathBuf>,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: None,
            interval_secs: default_sync_interval_secs(),
        }
    }
}

/// User-level configuration, read from `dirs::config_dir()/braid/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Fallback actor id when the workspace does not set one.
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Daemon transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Override for the Unix socket path.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Loopback TCP port used where domain sockets are unavailable.
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            port: default_daemon_port(),
        }
    }
}

/// Everything resolved: files merged, environment consulted, defaults
/// filled in.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub actor: String,
    pub remote: Option<PathBuf>,
    pub sync_interval: Duration,
    pub socket: Option<PathBuf>,
    pub port: u16,
}

/// Load `.braid/config.toml`, defaulting when absent.
///
/// # Errors
///
/// Fails only when the file exists but cannot be read or parsed.
pub fn load_workspace_config(root: &Path) -> Result<WorkspaceConfig> {
    let path = root.join(".braid/config.toml");
    if !path.exists() {
        return Ok(WorkspaceConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Load the user-level config, defaulting when absent.
///
/// # Errors
///
/// Fails only when the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("braid/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Merge workspace config, user config, environment, and an explicit
/// override into the effective settings for one workspace.
///
/// # Errors
///
/// Fails when either config file exists but cannot be read or parsed.
pub fn resolve_config(root: &Path, actor_override: Option<&str>) -> Result<EffectiveConfig> {
    let workspace = load_workspace_config(root)?;
    let user = load_user_config()?;

    let actor = resolve_actor(
        actor_override,
        workspace.actor.as_deref(),
        user.actor.as_deref(),
        env::var("BRAID_ACTOR").ok(),
        env::var("USER").ok(),
    );

    Ok(EffectiveConfig {
        actor,
        remote: workspace.sync.remote,
        sync_interval: Duration::from_secs(workspace.sync.interval_secs),
        socket: user.daemon.socket,
        port: user.daemon.port,
    })
}

/// Actor precedence: explicit override, workspace file, user file,
/// `BRAID_ACTOR`, `USER`, then a fixed fallback.
fn resolve_actor(
    explicit: Option<&str>,
    workspace: Option<&str>,
    user: Option<&str>,
    env_actor: Option<String>,
    env_user: Option<String>,
) -> String {
    let picked = explicit
        .map(str::to_string)
        .or_else(|| workspace.map(str::to_string))
        .or_else(|| user.map(str::to_string))
        .or(env_actor)
        .or(env_user)
        .unwrap_or_else(|| "anonymous".to_string());

    let trimmed = picked.trim();
    if trimmed.is_empty() {
        "anonymous".to_string()
    } else {
        trimmed.to_string()
    }
}

const fn default_sync_interval_secs() -> u64 {
    30
}

const fn default_daemon_port() -> u16 {
    7401
}
