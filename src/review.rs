//! Pre-submission review capability.
//!
//! Before a branch leaves the machine, an optional reviewer command audits
//! it. Each non-empty line of reviewer stdout is one finding; empty output
//! means the branch is clean. The pipeline feeds findings back into a fix
//! invocation and tracks the counts for stall detection.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewReport {
    pub findings: Vec<String>,
}

impl ReviewReport {
    pub fn count(&self) -> u32 {
        self.findings.len() as u32
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Findings joined for embedding in a fix instruction.
    pub fn as_text(&self) -> String {
        self.findings.join("\n")
    }
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, branch: &str) -> Result<ReviewReport>;
}

/// Reviewer backed by a configured shell command. The command receives the
/// branch name as `$1` and reports findings one per line on stdout. A
/// non-zero exit with no findings is a reviewer failure, not a clean pass.
pub struct CommandReviewer {
    command: String,
    workdir: PathBuf,
}

impl CommandReviewer {
    pub fn new(command: String, workdir: PathBuf) -> Self {
        Self { command, workdir }
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(&self, branch: &str) -> Result<ReviewReport> {
        debug!(command = %self.command, branch, "running reviewer");
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", self.command))
            .arg("reviewer")
            .arg(branch)
            .current_dir(&self.workdir)
            .output()
            .await
            .context("Failed to run reviewer command")?;

        let findings: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if !output.status.success() && findings.is_empty() {
            return Err(anyhow!(
                "Reviewer command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(ReviewReport { findings })
    }
}
