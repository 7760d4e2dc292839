//! Worker invocation boundary.
//!
//! One `Invocation` per phase per epic: the instruction payload goes to a
//! temporary file (never an inline argument, to dodge argv length limits),
//! the worker is spawned with a model tier and an explicit capability
//! allow-list, and its stream-json stdout is piped line-by-line through the
//! stream processor for the duration of the call.

use crate::config::Config;
use crate::errors::WorkerError;
use crate::events::EventLog;
use crate::phase::{Phase, PhaseSettings};
use crate::status::{StatusFile, TaskCounters};
use crate::stream::{PhaseAccumulator, StreamProcessor, TerminalResult};
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of one worker invocation.
#[derive(Debug)]
pub struct InvocationResult {
    pub id: Uuid,
    pub exit_code: i32,
    /// The terminal stream record, if one arrived before stdout closed.
    pub terminal: Option<TerminalResult>,
    pub accumulator: PhaseAccumulator,
    pub duration: Duration,
    /// True when the failure signature points at rate limiting; the caller
    /// applies backoff instead of an immediate retry.
    pub rate_limited: bool,
}

impl InvocationResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.terminal.as_ref().is_some_and(|t| !t.is_error)
    }

    pub fn result_text(&self) -> &str {
        self.terminal.as_ref().map(|t| t.result_text.as_str()).unwrap_or("")
    }
}

pub struct WorkerInvoker {
    config: Config,
}

impl WorkerInvoker {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run one invocation for `phase` of `epic_id`, streaming output through
    /// a fresh `StreamProcessor`. The accumulator starts at zero for every
    /// call: invocations carry no memory between phases or rounds.
    pub async fn invoke(
        &self,
        epic_id: u32,
        phase: Phase,
        settings: &PhaseSettings,
        instruction: &str,
        round: u32,
        log: &EventLog,
        status: &StatusFile,
        task_counters: Option<TaskCounters>,
    ) -> Result<InvocationResult, WorkerError> {
        let id = Uuid::new_v4();
        let payload_file = self.config.payload_file(epic_id, phase, round);
        write_payload(&payload_file, instruction)?;

        let transcript = self.config.transcript_file(epic_id, phase, round);
        let mut processor = StreamProcessor::new(log, status, epic_id, phase, transcript);
        if let Some(counters) = task_counters {
            processor.set_task_counters(counters);
        }

        let model = self.config.model_name(settings.model).to_string();
        let start = Instant::now();

        let payload = fs::File::open(&payload_file).map_err(|source| {
            WorkerError::PayloadWriteFailed {
                path: payload_file.clone(),
                source,
            }
        })?;

        let mut child = Command::new(&self.config.worker_cmd)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&model)
            .arg("--allowed-tools")
            .arg(settings.allowed_tools.join(","))
            .stdin(Stdio::from(payload))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.config.project_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::SpawnFailed {
                cmd: self.config.worker_cmd.clone(),
                source,
            })?;

        let pid = child.id();
        processor.set_worker_pid(pid);
        info!(invocation = %id, epic = epic_id, %phase, %model, pid, "worker spawned");

        // Drain stderr concurrently; a blocked stderr pipe would deadlock a
        // chatty worker.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::StreamTruncated)?;
        let mut lines = BufReader::new(stdout).lines();

        let mut acc = PhaseAccumulator::default();
        let mut terminal: Option<TerminalResult> = None;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| WorkerError::Other(e.into()))?
        {
            if let Some(result) = processor.process_line(&line, &mut acc)? {
                terminal = Some(result);
            }
        }

        let exit_status = child
            .wait()
            .await
            .map_err(|e| WorkerError::Other(e.into()))?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        let exit_code = exit_status.code().unwrap_or(-1);
        let duration = start.elapsed();

        // Payload served its purpose; transcripts stay, payloads do not.
        let _ = fs::remove_file(&payload_file);

        let rate_limited = is_rate_limited(exit_code, terminal.as_ref(), &stderr_text);
        debug!(
            invocation = %id,
            exit_code,
            rate_limited,
            elapsed_secs = duration.as_secs_f64(),
            "worker exited"
        );

        Ok(InvocationResult {
            id,
            exit_code,
            terminal,
            accumulator: acc,
            duration,
            rate_limited,
        })
    }
}

fn write_payload(path: &PathBuf, instruction: &str) -> Result<(), WorkerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| WorkerError::PayloadWriteFailed {
            path: path.clone(),
            source,
        })?;
    }
    fs::write(path, instruction).map_err(|source| WorkerError::PayloadWriteFailed {
        path: path.clone(),
        source,
    })
}

/// Classify a failed invocation as rate-limited from its terminal stop
/// reason, result text, or stderr.
fn is_rate_limited(exit_code: i32, terminal: Option<&TerminalResult>, stderr: &str) -> bool {
    let failed = exit_code != 0 || terminal.is_none_or(|t| t.is_error);
    if !failed {
        return false;
    }
    let mut haystack = stderr.to_lowercase();
    if let Some(t) = terminal {
        haystack.push_str(&t.stop_reason.to_lowercase());
        haystack.push_str(&t.result_text.to_lowercase());
    }
    haystack.contains("rate limit")
        || haystack.contains("rate_limit")
        || haystack.contains("429")
        || haystack.contains("overloaded")
}

/// Remove any instruction payload files left behind by an interrupted run.
pub fn cleanup_payload_files(config: &Config) {
    let pattern = config
        .log_dir
        .join("*-payload.md")
        .to_string_lossy()
        .to_string();
    if let Ok(entries) = glob::glob(&pattern) {
        for path in entries.flatten() {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn terminal(is_error: bool, stop_reason: &str, text: &str) -> TerminalResult {
        TerminalResult {
            result_text: text.to_string(),
            is_error,
            stop_reason: stop_reason.to_string(),
            cost_usd: 0.0,
            elapsed_secs: 1.0,
        }
    }

    #[test]
    fn test_rate_limit_from_stderr() {
        assert!(is_rate_limited(1, None, "HTTP 429 Too Many Requests"));
        assert!(is_rate_limited(1, None, "upstream rate limit reached"));
        assert!(!is_rate_limited(1, None, "segmentation fault"));
    }

    #[test]
    fn test_rate_limit_from_terminal_result() {
        let t = terminal(true, "rate_limit_error", "");
        assert!(is_rate_limited(0, Some(&t), ""));

        let t = terminal(true, "error", "API overloaded, try again later");
        assert!(is_rate_limited(0, Some(&t), ""));
    }

    #[test]
    fn test_successful_run_is_never_rate_limited() {
        let t = terminal(false, "end_turn", "rate limit discussion in prose");
        assert!(!is_rate_limited(0, Some(&t), ""));
    }

    #[test]
    fn test_succeeded_requires_clean_exit_and_terminal() {
        let ok = InvocationResult {
            id: Uuid::new_v4(),
            exit_code: 0,
            terminal: Some(terminal(false, "end_turn", "done")),
            accumulator: PhaseAccumulator::default(),
            duration: Duration::from_secs(1),
            rate_limited: false,
        };
        assert!(ok.succeeded());
        assert_eq!(ok.result_text(), "done");

        let no_terminal = InvocationResult {
            terminal: None,
            ..ok
        };
        assert!(!no_terminal.succeeded());
        assert_eq!(no_terminal.result_text(), "");
    }

    #[test]
    fn test_cleanup_payload_files() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, false).unwrap();
        config.ensure_directories().unwrap();

        let payload = config.payload_file(1, Phase::Plan, 1);
        let transcript = config.transcript_file(1, Phase::Plan, 1);
        fs::write(&payload, "instruction").unwrap();
        fs::write(&transcript, "result").unwrap();

        cleanup_payload_files(&config);
        assert!(!payload.exists());
        assert!(transcript.exists());
    }
}
