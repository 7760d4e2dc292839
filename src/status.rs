//! Live status snapshot.
//!
//! The single overwritten-in-place record of "what is happening right now" for
//! the one in-flight epic/phase pair. Writes are best-effort: a failed
//! snapshot write is logged and swallowed, never allowed to abort an
//! invocation. Consumers polling the file must treat a snapshot whose pid is
//! dead and whose last-activity timestamp is stale as idle, not crashed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Grace window after which a snapshot with a dead worker pid reads as idle.
pub const STALE_GRACE_SECS: i64 = 120;

/// Task-completion counters shown while the implement phase runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub checked: u32,
    pub unchecked: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub epic: u32,
    pub phase: String,
    #[serde(default)]
    pub last_tool: Option<String>,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    #[serde(default)]
    pub worker_pid: Option<u32>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskCounters>,
}

impl StatusSnapshot {
    pub fn new(epic: u32, phase: &str) -> Self {
        Self {
            epic,
            phase: phase.to_string(),
            last_tool: None,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            worker_pid: None,
            last_activity: Utc::now(),
            tasks: None,
        }
    }

    /// A snapshot whose worker process is gone and whose last activity is
    /// older than the grace window means the orchestrator is between
    /// invocations (or was stopped), not crashed.
    pub fn is_idle(&self, pid_alive: bool, now: DateTime<Utc>) -> bool {
        !pid_alive && now - self.last_activity > Duration::seconds(STALE_GRACE_SECS)
    }
}

/// Writer for the single current-status file.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Overwrite the snapshot in place. Best-effort: failures are logged and
    /// dropped so a full disk can never abort a running invocation.
    pub fn write(&self, snapshot: &StatusSnapshot) {
        let result = serde_json::to_string_pretty(snapshot)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.path, json)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to write status snapshot");
        }
    }

    /// Read the current snapshot. Partial reads (a concurrent overwrite in
    /// progress) come back as `None`; pollers just retry.
    pub fn read(&self) -> Option<StatusSnapshot> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}
