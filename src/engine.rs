//! Per-phase execution engine.
//!
//! One `run_next_phase` call derives the current phase from disk, drives
//! worker invocations under the phase's retry policy, and reports how the
//! epic moved. The engine never records which phase it thinks an epic is in;
//! after every invocation it re-derives the phase from artifacts, so a kill
//! at any point resumes cleanly.

use crate::config::Config;
use crate::converge::ConvergenceSeries;
use crate::detect::{self, EpicPaths};
use crate::epic::Epic;
use crate::errors::EngineError;
use crate::events::{Event, EventKind, EventLog};
use crate::phase::{Phase, rate_limit_backoff};
use crate::prompts::PromptProvider;
use crate::retry::{Attempt, Exhaustion, RetryPolicy, RunOutcome, run_attempts};
use crate::status::{StatusFile, TaskCounters};
use crate::vcs::VersionControl;
use crate::worker::WorkerInvoker;
use anyhow::{Context, Result, anyhow};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

/// How one engine step moved the epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Detection changed after one or more rounds. A verify phase that
    /// rejects moves backwards; that still counts as movement.
    Advanced { from: Phase, to: Phase },
    /// An iterative phase plateaued or ran out of rounds and its completion
    /// marker was injected by the engine.
    ForceAdvanced { phase: Phase },
    /// All tasks are done and the branch awaits integration.
    ReadyForIntegration,
    /// The epic is merged; nothing left to run.
    Terminal,
}

pub struct PhaseEngine {
    config: Config,
    invoker: WorkerInvoker,
    prompts: Arc<dyn PromptProvider>,
    vcs: Arc<dyn VersionControl>,
    log: EventLog,
    status: StatusFile,
}

impl PhaseEngine {
    pub fn new(
        config: Config,
        prompts: Arc<dyn PromptProvider>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        let log = EventLog::new(config.events_file.clone());
        let status = StatusFile::new(config.status_file.clone());
        let invoker = WorkerInvoker::new(config.clone());
        Self {
            config,
            invoker,
            prompts,
            vcs,
            log,
            status,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn status_file(&self) -> &StatusFile {
        &self.status
    }

    /// Artifact locations for an epic. Before specify has run, the expected
    /// branch name stands in for the recorded one.
    pub fn paths_for(&self, epic: &Epic) -> EpicPaths {
        let branch = epic
            .branch_name
            .clone()
            .unwrap_or_else(|| epic.expected_branch_name());
        EpicPaths::new(&self.config.project_dir, &branch)
    }

    /// Derive the epic's current phase from disk.
    pub fn current_phase(&self, epic: &Epic) -> Phase {
        detect::detect(&self.paths_for(epic), epic.is_merged())
    }

    /// Run the engine for whatever phase the artifacts currently indicate.
    pub async fn run_next_phase(&self, epic: &mut Epic) -> Result<PhaseOutcome, EngineError> {
        let phase = self.current_phase(epic);
        match phase {
            Phase::Done => return Ok(PhaseOutcome::Terminal),
            Phase::Review => return Ok(PhaseOutcome::ReadyForIntegration),
            Phase::Specify => {}
            _ => {
                if epic.branch_name.is_none() {
                    return Err(EngineError::MissingBranch { epic: epic.id });
                }
            }
        }

        let outcome = self.run_phase(epic, phase).await?;
        if phase == Phase::Specify
            && !matches!(outcome, PhaseOutcome::Terminal)
        {
            self.reconcile_branch(epic)
                .await
                .map_err(EngineError::Other)?;
        }
        Ok(outcome)
    }

    /// Drive one phase to movement, force-advance, or exhaustion.
    async fn run_phase(&self, epic: &Epic, phase: Phase) -> Result<PhaseOutcome, EngineError> {
        let settings = self.config.phase_settings(phase);
        let paths = self.paths_for(epic);
        let policy = if phase.is_iterative() {
            RetryPolicy::force_advance(settings.max_attempts)
        } else {
            RetryPolicy::fatal(settings.max_attempts)
        };

        info!(epic = epic.id, %phase, max_attempts = settings.max_attempts, "running phase");

        retract_stale_verification(phase, &paths).map_err(EngineError::Other)?;

        // The series and the epic reference thread through an async FnMut;
        // interior mutability keeps the closure borrows honest. Borrows are
        // taken and released around each await, never across one.
        let series = RefCell::new(ConvergenceSeries::new());
        let stall_logged = Cell::new(false);
        let outcome = run_attempts(&policy, phase.slug(), |round| {
            let settings = &settings;
            let paths = &paths;
            let series = &series;
            let stall_logged = &stall_logged;
            async move {
                let instruction = self.prompts.instruction(phase, epic, paths);
                let counters = task_counters_for(phase, paths);
                let result = self
                    .invoker
                    .invoke(
                        epic.id,
                        phase,
                        settings,
                        &instruction,
                        round,
                        &self.log,
                        &self.status,
                        counters,
                    )
                    .await?;

                if result.rate_limited {
                    return Ok(Attempt::RetryAfter(rate_limit_backoff(round)));
                }

                // Detection after the invocation is the only progress signal;
                // worker exit codes and result text are advisory.
                let now = detect::detect(paths, epic.is_merged());
                if now != phase {
                    return Ok(Attempt::Done(now));
                }

                if !result.succeeded() {
                    warn!(
                        epic = epic.id,
                        %phase,
                        round,
                        exit_code = result.exit_code,
                        "worker round failed without phase movement"
                    );
                    return Ok(Attempt::Retry);
                }

                if phase.is_iterative() {
                    let findings = detect::open_findings(paths, phase);
                    let (stalled, counts) = {
                        let mut series = series.borrow_mut();
                        series.push(findings);
                        (series.is_stalled(settings.window), series.counts().to_vec())
                    };

                    if findings == 0 {
                        // Converged but the worker forgot the marker; the
                        // count is the authority, so finish the phase here.
                        self.mark_complete(epic, phase, paths, "converged").await?;
                        let now = detect::detect(paths, epic.is_merged());
                        return Ok(Attempt::Done(now));
                    }
                    // A stall is recorded but does not end the phase early;
                    // remaining rounds may still shrink the count.
                    if stalled && !stall_logged.get() {
                        stall_logged.set(true);
                        self.log.append(&Event::new(
                            EventKind::Stall,
                            epic.id,
                            phase.slug(),
                            json!({ "counts": counts, "window": settings.window }),
                        ))?;
                    }
                }

                Ok(Attempt::Retry)
            }
        })
        .await
        .map_err(EngineError::Other)?;

        match outcome {
            RunOutcome::Completed(to) => {
                self.log.append(&Event::new(
                    EventKind::PhaseAdvance,
                    epic.id,
                    phase.slug(),
                    json!({ "from": phase.slug(), "to": to.slug() }),
                ))?;
                info!(epic = epic.id, from = %phase, to = %to, "phase advanced");
                Ok(PhaseOutcome::Advanced { from: phase, to })
            }
            RunOutcome::Exhausted(Exhaustion::ForceAdvance) => {
                self.force_advance(epic, phase, &paths).await?;
                Ok(PhaseOutcome::ForceAdvanced { phase })
            }
            RunOutcome::Exhausted(Exhaustion::Fatal) => Err(EngineError::AttemptsExhausted {
                phase: phase.slug().to_string(),
                attempts: settings.max_attempts,
                epic: epic.id,
            }),
        }
    }

    /// Inject the phase's completion marker and commit, moving past a
    /// plateaued or exhausted iterative phase.
    async fn force_advance(
        &self,
        epic: &Epic,
        phase: Phase,
        paths: &EpicPaths,
    ) -> Result<(), EngineError> {
        warn!(epic = epic.id, %phase, "force-advancing past unconverged phase");
        self.mark_complete(epic, phase, paths, "force_advance").await?;
        self.log.append(&Event::new(
            EventKind::ForceAdvance,
            epic.id,
            phase.slug(),
            json!({ "findings_remaining": detect::open_findings(paths, phase) }),
        ))?;
        Ok(())
    }

    async fn mark_complete(
        &self,
        epic: &Epic,
        phase: Phase,
        paths: &EpicPaths,
        reason: &str,
    ) -> Result<()> {
        let (marker, artifact) = detect::completion_marker(phase)
            .ok_or_else(|| anyhow!("Phase {} has no completion marker", phase))?;
        let path = artifact.path(paths);
        detect::inject_marker(path, marker)
            .with_context(|| format!("Failed to mark {} in {}", marker, path.display()))?;
        self.vcs
            .commit_all(&format!(
                "chore(epic-{:03}): mark {} complete ({})",
                epic.id,
                phase.slug(),
                reason
            ))
            .await?;
        Ok(())
    }

    /// After specify, adopt whatever branch/directory name the worker
    /// actually created. The slug is stable; the numeric prefix may not be.
    async fn reconcile_branch(&self, epic: &mut Epic) -> Result<()> {
        let slug = epic.branch_slug();
        let pattern = self
            .config
            .project_dir
            .join("specs")
            .join(format!("*-{}", slug))
            .to_string_lossy()
            .to_string();

        let mut candidates: Vec<_> = glob::glob(&pattern)
            .context("Failed to scan artifact directories")?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_dir())
            .collect();
        candidates.sort();

        let Some(dir) = candidates.first() else {
            return Ok(());
        };
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };

        if epic.branch_name.as_deref() != Some(name) {
            info!(epic = epic.id, branch = name, "recording branch created by specify");
            epic.set_branch_name(name)?;
        }
        if self.vcs.branch_exists(name).await? && self.vcs.current_branch().await? != name {
            self.vcs.checkout(name).await?;
        }
        Ok(())
    }
}

/// Re-entering an iterative phase invalidates any verification left over from
/// an earlier pass; the phase must be re-verified after it converges again.
/// This is the enforcement half of the retraction rule: the worker retracts
/// completion markers, the engine retracts the verify marker they guarded.
fn retract_stale_verification(phase: Phase, paths: &EpicPaths) -> Result<()> {
    let verify = match phase {
        Phase::Clarify => Phase::ClarifyVerify,
        Phase::Analyze => Phase::AnalyzeVerify,
        _ => return Ok(()),
    };
    let Some((marker, artifact)) = detect::completion_marker(verify) else {
        return Ok(());
    };
    let path = artifact.path(paths);
    if detect::retract_marker(path, marker)
        .with_context(|| format!("Failed to retract {} from {}", marker, path.display()))?
    {
        warn!(%phase, marker, "retracted stale verification marker");
    }
    Ok(())
}

/// Live task counters for the status snapshot during implement rounds.
fn task_counters_for(phase: Phase, paths: &EpicPaths) -> Option<TaskCounters> {
    if phase != Phase::Implement {
        return None;
    }
    let tasks = fs::read_to_string(&paths.tasks).unwrap_or_default();
    let (checked, unchecked) = detect::count_checkboxes(&tasks);
    Some(TaskCounters { checked, unchecked })
}
