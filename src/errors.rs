//! Typed error hierarchy for the drover orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `WorkerError` — spawning and streaming a single worker invocation
//! - `EngineError` — per-phase execution failures
//! - `PipelineError` — integration pipeline failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from one worker invocation.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker process '{cmd}': {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write instruction payload at {path}: {source}")]
    PayloadWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker stdout closed before a terminal result arrived")]
    StreamTruncated,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single phase's execution loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "Phase {phase} exhausted {attempts} attempts without advancing; \
         resume with: drover epic {epic}"
    )]
    AttemptsExhausted {
        phase: String,
        attempts: u32,
        epic: u32,
    },

    #[error("Epic {epic} has no recorded branch name but is past specify")]
    MissingBranch { epic: u32 },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the integration pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Rebase conflicts unresolved after {attempts} attempts: {paths:?}")]
    RebaseUnresolved { attempts: u32, paths: Vec<String> },

    #[error("Push rejected for branch {branch} (lease failed)")]
    PushRejected { branch: String },

    #[error("Merge failed for branch {branch}: {reason}")]
    MergeFailed { branch: String, reason: String },

    #[error("Pre-submission review stalled at {findings} findings")]
    ReviewStalled { findings: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
