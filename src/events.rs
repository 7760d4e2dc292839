//! Durable append-only event log.
//!
//! The log is the single source of truth for cost accounting and phase-timing
//! reconstruction. Appends must never be silently dropped: a failed append
//! propagates to the caller, unlike the best-effort status snapshot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Kinds of durable events the orchestrator records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionInit,
    ToolUse,
    ToolError,
    PhaseEnd,
    PhaseAdvance,
    ForceAdvance,
    Stall,
    RebaseConflict,
    ReviewRound,
    PrOpened,
    Merged,
    FinalizeRound,
}

/// One immutable record in the durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
    pub epic: u32,
    pub phase: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(event: EventKind, epic: u32, phase: &str, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            epic,
            phase: phase.to_string(),
            payload,
        }
    }
}

/// Append-only JSONL log, one event per line.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one event. Not best-effort: a failure here must propagate,
    /// since cost/timing accounting depends on completeness of the log.
    pub fn append(&self, event: &Event) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open event log: {}", self.path.display()))?;
        writeln!(file, "{}", line).context("Failed to append event")?;
        Ok(())
    }

    /// Read every event back, skipping lines that fail to parse (a torn final
    /// line after a crash must not poison the whole log).
    pub fn read_all(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read event log: {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Total cost for one epic, summed over its `phase_end` events. By
    /// construction this equals the per-invocation costs regardless of how
    /// many rounds any iterative phase took.
    pub fn epic_cost(&self, epic: u32) -> Result<f64> {
        Ok(self
            .read_all()?
            .iter()
            .filter(|e| e.epic == epic && e.event == EventKind::PhaseEnd)
            .filter_map(|e| e.payload.get("cost_usd").and_then(|v| v.as_f64()))
            .sum())
    }

    /// Per-phase elapsed seconds for one epic, in log order.
    pub fn epic_timings(&self, epic: u32) -> Result<Vec<(String, f64)>> {
        Ok(self
            .read_all()?
            .iter()
            .filter(|e| e.epic == epic && e.event == EventKind::PhaseEnd)
            .filter_map(|e| {
                e.payload
                    .get("elapsed_secs")
                    .and_then(|v| v.as_f64())
                    .map(|secs| (e.phase.clone(), secs))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn log_in(dir: &std::path::Path) -> EventLog {
        EventLog::new(dir.join("events.jsonl"))
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        log.append(&Event::new(EventKind::SessionInit, 1, "specify", json!({})))
            .unwrap();
        log.append(&Event::new(
            EventKind::ToolUse,
            1,
            "specify",
            json!({"tool": "Write", "target": "spec.md"}),
        ))
        .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, EventKind::SessionInit);
        assert_eq!(events[1].payload["tool"], "Write");
        assert!(events[0].timestamp <= Utc::now());
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        assert!(log_in(dir.path()).read_all().unwrap().is_empty());
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.append(&Event::new(EventKind::SessionInit, 1, "plan", json!({})))
            .unwrap();
        // Simulate a crash mid-append.
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap();
        write!(file, "{{\"timestamp\":").unwrap();
        drop(file);

        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_epic_cost_sums_phase_end_events() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());

        for (epic, phase, cost) in [
            (1, "clarify", 0.25),
            (1, "clarify", 0.30),
            (1, "plan", 1.10),
            (2, "specify", 9.99),
        ] {
            log.append(&Event::new(
                EventKind::PhaseEnd,
                epic,
                phase,
                json!({"cost_usd": cost, "elapsed_secs": 12.0}),
            ))
            .unwrap();
        }
        // Non-terminal events never contribute to cost.
        log.append(&Event::new(
            EventKind::ToolUse,
            1,
            "plan",
            json!({"cost_usd": 100.0}),
        ))
        .unwrap();

        let total = log.epic_cost(1).unwrap();
        assert!((total - 1.65).abs() < 1e-9);
    }

    #[test]
    fn test_epic_timings_in_log_order() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        for (phase, secs) in [("specify", 30.0), ("clarify", 45.5)] {
            log.append(&Event::new(
                EventKind::PhaseEnd,
                3,
                phase,
                json!({"cost_usd": 0.1, "elapsed_secs": secs}),
            ))
            .unwrap();
        }

        let timings = log.epic_timings(3).unwrap();
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[0], ("specify".to_string(), 30.0));
        assert_eq!(timings[1], ("clarify".to_string(), 45.5));
    }
}
