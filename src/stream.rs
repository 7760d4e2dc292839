//! Event stream processing for worker invocations.
//!
//! The worker emits line-delimited JSON on stdout. Each line is translated
//! into (a) durable events appended to the log, (b) a per-phase transcript,
//! and (c) a refreshed live-status snapshot. Durable appends propagate
//! failures; snapshot writes are best-effort.

use crate::events::{Event, EventKind, EventLog};
use crate::phase::Phase;
use crate::status::{StatusFile, StatusSnapshot, TaskCounters};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

/// Fixed ceiling for any free-text excerpt embedded in a durable event, so
/// pathological tool output can never bloat the log.
pub const MAX_EXCERPT: usize = 200;

/// Events from the worker's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<UserMessage>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        stop_reason: Option<String>,
    },

    /// Catch-all for stream kinds that only restate what the terminal result
    /// already carries; processed as a no-op to avoid double counting.
    #[serde(other)]
    Redundant,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<UserContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum UserContent {
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Token/cost accumulation for exactly one phase invocation.
///
/// An explicit value passed into and returned from stream processing, never a
/// process-wide accumulator, so phases and epics cannot cross-contaminate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost_usd: f64,
}

impl PhaseAccumulator {
    fn add_usage(&mut self, usage: &Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cached_tokens += usage.cache_read_input_tokens;
    }
}

/// Outcome of the terminal `result` record.
#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub result_text: String,
    pub is_error: bool,
    pub stop_reason: String,
    pub cost_usd: f64,
    pub elapsed_secs: f64,
}

/// Per-invocation stream processor: owns the snapshot it refreshes and the
/// transcript it persists, borrows the durable log.
pub struct StreamProcessor<'a> {
    log: &'a EventLog,
    status: &'a StatusFile,
    epic: u32,
    phase: Phase,
    transcript: PathBuf,
    snapshot: StatusSnapshot,
    started: Instant,
}

impl<'a> StreamProcessor<'a> {
    pub fn new(
        log: &'a EventLog,
        status: &'a StatusFile,
        epic: u32,
        phase: Phase,
        transcript: PathBuf,
    ) -> Self {
        let snapshot = StatusSnapshot::new(epic, phase.slug());
        Self {
            log,
            status,
            epic,
            phase,
            transcript,
            snapshot,
            started: Instant::now(),
        }
    }

    /// Record the spawned worker's pid in the snapshot.
    pub fn set_worker_pid(&mut self, pid: Option<u32>) {
        self.snapshot.worker_pid = pid;
        self.refresh_snapshot(None);
    }

    /// Surface task-completion counters during the implement phase.
    pub fn set_task_counters(&mut self, counters: TaskCounters) {
        self.snapshot.tasks = Some(counters);
    }

    /// Translate one stream line. Returns the terminal result once the
    /// worker's final record arrives; lines that fail to parse as stream
    /// events are ignored (stderr noise interleaved on stdout).
    pub fn process_line(
        &mut self,
        line: &str,
        acc: &mut PhaseAccumulator,
    ) -> Result<Option<TerminalResult>> {
        if line.is_empty() {
            return Ok(None);
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            return Ok(None);
        };

        match event {
            StreamEvent::System { subtype, session_id } => {
                if subtype == "init" {
                    self.append(
                        EventKind::SessionInit,
                        json!({"session_id": session_id}),
                    )?;
                    self.refresh_snapshot(Some(acc));
                }
                // Other system subtypes restate later records; dropped.
            }
            StreamEvent::Assistant { message } => {
                if let Some(usage) = &message.usage {
                    acc.add_usage(usage);
                }
                for block in message.content {
                    if let ContentBlock::ToolUse { name, input, .. } = block {
                        let desc = describe_tool_use(&name, &input);
                        self.append(
                            EventKind::ToolUse,
                            json!({"tool": name, "target": desc}),
                        )?;
                        self.snapshot.last_tool = Some(format!("{}: {}", name, desc));
                        self.refresh_snapshot(Some(acc));
                    }
                }
            }
            StreamEvent::User { message } => {
                let blocks = message.map(|m| m.content).unwrap_or_default();
                for block in blocks {
                    if let UserContent::ToolResult { is_error, content } = block
                        && is_error
                    {
                        let excerpt = truncate_str(&flatten_content(&content), MAX_EXCERPT);
                        self.append(EventKind::ToolError, json!({"error": excerpt}))?;
                    }
                }
            }
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                total_cost_usd,
                usage,
                stop_reason,
            } => {
                // The terminal record restates the session's total usage;
                // counting it on top of the per-step sums would double every
                // token. Use it only when no step-level usage ever arrived.
                if let Some(usage) = &usage
                    && acc.input_tokens == 0
                    && acc.output_tokens == 0
                {
                    acc.add_usage(usage);
                }
                acc.cost_usd = total_cost_usd.unwrap_or(acc.cost_usd);
                let stop_reason = stop_reason.unwrap_or(subtype);
                let elapsed_secs = self.started.elapsed().as_secs_f64();

                self.append(
                    EventKind::PhaseEnd,
                    json!({
                        "elapsed_secs": elapsed_secs,
                        "cost_usd": acc.cost_usd,
                        "input_tokens": acc.input_tokens,
                        "output_tokens": acc.output_tokens,
                        "cached_tokens": acc.cached_tokens,
                        "stop_reason": stop_reason,
                        "is_error": is_error,
                    }),
                )?;

                let result_text = result.unwrap_or_default();
                self.write_transcript(&result_text)?;
                self.refresh_snapshot(Some(acc));

                return Ok(Some(TerminalResult {
                    result_text,
                    is_error,
                    stop_reason,
                    cost_usd: acc.cost_usd,
                    elapsed_secs,
                }));
            }
            StreamEvent::Redundant => {}
        }

        Ok(None)
    }

    fn append(&self, kind: EventKind, payload: Value) -> Result<()> {
        self.log
            .append(&Event::new(kind, self.epic, self.phase.slug(), payload))
    }

    fn refresh_snapshot(&mut self, acc: Option<&PhaseAccumulator>) {
        if let Some(acc) = acc {
            self.snapshot.cost_usd = acc.cost_usd;
            self.snapshot.input_tokens = acc.input_tokens;
            self.snapshot.output_tokens = acc.output_tokens;
            self.snapshot.cached_tokens = acc.cached_tokens;
        }
        self.snapshot.last_activity = chrono::Utc::now();
        self.status.write(&self.snapshot);
    }

    fn write_transcript(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.transcript.parent() {
            fs::create_dir_all(parent).context("Failed to create transcript directory")?;
        }
        fs::write(&self.transcript, text).with_context(|| {
            format!("Failed to write transcript: {}", self.transcript.display())
        })
    }
}

/// Extract a human-readable, bounded description of a tool invocation's
/// target from its input payload.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let described = match name {
        "Read" | "Write" | "Edit" => input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path),
        "Bash" => input
            .get("command")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        "Glob" | "Grep" => input
            .get("pattern")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        "Task" => input
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    };
    truncate_str(&described.unwrap_or_else(|| name.to_string()), MAX_EXCERPT)
}

/// Shorten a file path to its last two components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis, on a char boundary.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}
