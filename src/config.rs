//! Runtime configuration for drover.
//!
//! `Config` bridges CLI arguments, an optional `drover.toml` at the project
//! root, and environment-variable fallbacks. Precondition failures (missing
//! epics directory, unresolvable worker command) are fatal here, before any
//! epic work begins.

use crate::phase::{ModelTier, Phase, PhaseSettings};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Contents of `drover.toml`. Every field is optional; defaults cover the
/// rest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DroverToml {
    pub worker_cmd: Option<String>,
    pub target_branch: Option<String>,
    /// Project test command run after a clean rebase (e.g. "cargo test").
    pub test_command: Option<String>,
    /// Pre-submission lint-reviewer command; absent disables that stage.
    pub reviewer_cmd: Option<String>,
    /// On a stalled pre-submission review loop: halt (default) or proceed.
    #[serde(default)]
    pub force_advance_on_review_stall: bool,
    /// Model names the worker understands, per tier.
    #[serde(default)]
    pub models: ModelNames,
    /// Per-phase overrides keyed by phase slug.
    #[serde(default)]
    pub phases: HashMap<String, PhaseOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelNames {
    pub fast: String,
    pub standard: String,
    pub deep: String,
}

impl Default for ModelNames {
    fn default() -> Self {
        Self {
            fast: "haiku".to_string(),
            standard: "sonnet".to_string(),
            deep: "opus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseOverride {
    pub model: Option<ModelTier>,
    pub allowed_tools: Option<Vec<String>>,
    pub max_attempts: Option<u32>,
    pub window: Option<usize>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub epics_dir: PathBuf,
    pub drover_dir: PathBuf,
    pub log_dir: PathBuf,
    pub summaries_dir: PathBuf,
    pub events_file: PathBuf,
    pub status_file: PathBuf,
    pub worker_cmd: String,
    pub target_branch: String,
    pub test_command: Option<String>,
    pub reviewer_cmd: Option<String>,
    pub force_advance_on_review_stall: bool,
    pub verbose: bool,
    pub assume_yes: bool,
    toml: DroverToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, assume_yes: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let toml = load_toml(&project_dir.join("drover.toml"))?;

        let worker_cmd = toml
            .worker_cmd
            .clone()
            .or_else(|| std::env::var("DROVER_WORKER_CMD").ok())
            .unwrap_or_else(|| "claude".to_string());

        let drover_dir = project_dir.join(".drover");
        Ok(Self {
            epics_dir: project_dir.join("epics"),
            log_dir: drover_dir.join("logs"),
            summaries_dir: drover_dir.join("summaries"),
            events_file: drover_dir.join("events.jsonl"),
            status_file: drover_dir.join("status.json"),
            worker_cmd,
            target_branch: toml.target_branch.clone().unwrap_or_else(|| "main".to_string()),
            test_command: toml.test_command.clone(),
            reviewer_cmd: toml.reviewer_cmd.clone(),
            force_advance_on_review_stall: toml.force_advance_on_review_stall,
            verbose,
            assume_yes,
            project_dir,
            drover_dir,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.summaries_dir)
            .context("Failed to create summaries directory")?;
        Ok(())
    }

    /// Fatal-at-startup checks; nothing may run before these pass.
    pub fn preflight(&self) -> Result<()> {
        if !self.epics_dir.exists() {
            return Err(anyhow!(
                "Epics directory not found: {} (create it and add epic documents)",
                self.epics_dir.display()
            ));
        }
        if !command_resolvable(&self.worker_cmd) {
            return Err(anyhow!(
                "Worker command '{}' not found on PATH (set worker_cmd in drover.toml or DROVER_WORKER_CMD)",
                self.worker_cmd
            ));
        }
        Ok(())
    }

    /// Effective settings for a phase: defaults overlaid with any
    /// `[phases.<slug>]` entries from drover.toml.
    pub fn phase_settings(&self, phase: Phase) -> PhaseSettings {
        let mut settings = PhaseSettings::defaults_for(phase);
        if let Some(over) = self.toml.phases.get(phase.slug()) {
            if let Some(model) = over.model {
                settings.model = model;
            }
            if let Some(tools) = &over.allowed_tools {
                settings.allowed_tools = tools.clone();
            }
            if let Some(max) = over.max_attempts {
                settings.max_attempts = max;
            }
            if let Some(window) = over.window {
                settings.window = window;
            }
        }
        settings
    }

    /// Worker model name for a tier.
    pub fn model_name(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.toml.models.fast,
            ModelTier::Standard => &self.toml.models.standard,
            ModelTier::Deep => &self.toml.models.deep,
        }
    }

    /// Transcript file for one phase invocation.
    pub fn transcript_file(&self, epic: u32, phase: Phase, round: u32) -> PathBuf {
        self.log_dir
            .join(format!("epic-{:03}-{}-round-{}.log", epic, phase.slug(), round))
    }

    /// Instruction payload file for one phase invocation. Delivered to the
    /// worker as a file reference, never an inline argument.
    pub fn payload_file(&self, epic: u32, phase: Phase, round: u32) -> PathBuf {
        self.log_dir
            .join(format!("epic-{:03}-{}-round-{}-payload.md", epic, phase.slug(), round))
    }
}

fn load_toml(path: &Path) -> Result<DroverToml> {
    if !path.exists() {
        return Ok(DroverToml::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
}

fn command_resolvable(cmd: &str) -> bool {
    let path = Path::new(cmd);
    if path.components().count() > 1 {
        return path.exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(cmd).is_file())
}
