//! Epic scheduling: the outermost loop of a run.
//!
//! Epics execute strictly sequentially, ordered by id. One worker invocation
//! is in flight at any time; the scheduler never runs phases of different
//! epics concurrently, which keeps the status snapshot and event log
//! single-writer by construction.

use crate::config::Config;
use crate::engine::{PhaseEngine, PhaseOutcome};
use crate::epic::{self, Epic};
use crate::events::{Event, EventKind, EventLog};
use crate::host::{CodeHost, GhHost};
use crate::integrate::IntegrationPipeline;
use crate::phase::Phase;
use crate::prompts::{DefaultPrompts, PromptProvider};
use crate::review::{CommandReviewer, Reviewer};
use crate::status::StatusFile;
use crate::ui::Ui;
use crate::vcs::{GitBackend, VersionControl};
use crate::worker::WorkerInvoker;
use anyhow::{Context, Result, anyhow};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

/// Upper bound on engine steps per epic. The detector makes forward progress
/// every step in practice; this guard turns a regression into a clean error
/// instead of an unbounded loop.
const MAX_STEPS_PER_EPIC: u32 = 200;

/// Fix rounds for a failing finalize check before giving up.
const MAX_FINALIZE_ROUNDS: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub merged: Vec<u32>,
    pub skipped: Vec<u32>,
}

pub struct Scheduler {
    config: Config,
    engine: PhaseEngine,
    pipeline: IntegrationPipeline,
    invoker: WorkerInvoker,
    reviewer: Option<Arc<dyn Reviewer>>,
    log: EventLog,
    status: StatusFile,
    ui: Ui,
}

impl Scheduler {
    /// Wire up the production adapters. Opening the git backend validates
    /// that the project directory is a repository.
    pub fn new(config: Config) -> Result<Self> {
        let vcs: Arc<dyn VersionControl> = Arc::new(GitBackend::open(&config.project_dir)?);
        let host: Arc<dyn CodeHost> = Arc::new(GhHost::new(config.project_dir.clone()));
        let prompts: Arc<dyn PromptProvider> = Arc::new(DefaultPrompts);
        let reviewer: Option<Arc<dyn Reviewer>> = config.reviewer_cmd.clone().map(|cmd| {
            Arc::new(CommandReviewer::new(cmd, config.project_dir.clone())) as Arc<dyn Reviewer>
        });

        Ok(Self {
            engine: PhaseEngine::new(config.clone(), prompts.clone(), vcs.clone()),
            pipeline: IntegrationPipeline::new(
                config.clone(),
                prompts,
                vcs,
                host,
                reviewer.clone(),
            ),
            invoker: WorkerInvoker::new(config.clone()),
            reviewer,
            log: EventLog::new(config.events_file.clone()),
            status: StatusFile::new(config.status_file.clone()),
            ui: Ui,
            config,
        })
    }

    /// Process every epic in id order, skipping merged ones, then finalize.
    pub async fn run(&self) -> Result<RunReport> {
        let epics = epic::scan_epics(&self.config.epics_dir)?;
        if epics.is_empty() {
            return Err(anyhow!(
                "No epic documents found in {}",
                self.config.epics_dir.display()
            ));
        }

        let pending = epics.iter().filter(|e| !e.is_merged()).count();
        self.ui
            .banner(&format!("drover: {} epics, {} pending", epics.len(), pending));

        let mut report = RunReport::default();
        for mut epic in epics {
            if epic.is_merged() {
                self.ui.skipped(&epic);
                report.skipped.push(epic.id);
                continue;
            }
            if !self.confirm(&format!("Start epic {:03} ({})?", epic.id, epic.title))? {
                self.ui.note(&format!("epic {:03} deferred", epic.id));
                report.skipped.push(epic.id);
                continue;
            }
            self.drive_epic(&mut epic)
                .await
                .with_context(|| format!("Epic {:03} ({}) failed", epic.id, epic.title))?;
            report.merged.push(epic.id);
        }

        if !report.merged.is_empty() {
            self.finalize().await?;
            self.write_project_summary(&report)?;
        }
        self.status.clear();
        Ok(report)
    }

    /// Process one epic by id, regardless of siblings.
    pub async fn run_one(&self, id: u32) -> Result<()> {
        let epics = epic::scan_epics(&self.config.epics_dir)?;
        let mut epic = epics
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("No epic with id {}", id))?;
        if epic.is_merged() {
            self.ui.skipped(&epic);
            return Ok(());
        }
        self.drive_epic(&mut epic).await?;
        self.status.clear();
        Ok(())
    }

    /// Step the engine until the epic is merged.
    async fn drive_epic(&self, epic: &mut Epic) -> Result<()> {
        self.ui.epic_start(epic, self.engine.current_phase(epic));

        for _ in 0..MAX_STEPS_PER_EPIC {
            match self.engine.run_next_phase(epic).await? {
                PhaseOutcome::Advanced { from, to } => {
                    self.ui.phase_advance(from, to);
                }
                PhaseOutcome::ForceAdvanced { phase } => {
                    self.ui.force_advance(phase);
                }
                PhaseOutcome::ReadyForIntegration => {
                    self.ui.integrating(epic);
                    self.pipeline.integrate(epic).await?;
                }
                PhaseOutcome::Terminal => {
                    let cost = self.log.epic_cost(epic.id).unwrap_or_default();
                    self.ui.merged(epic, cost);
                    self.write_summary(epic)?;
                    return Ok(());
                }
            }
        }
        Err(anyhow!(
            "Epic {:03} did not reach a terminal phase within {} engine steps",
            epic.id,
            MAX_STEPS_PER_EPIC
        ))
    }

    /// Post-run check: run the project's test command, with bounded
    /// worker-assisted fixing when it fails.
    pub async fn finalize(&self) -> Result<()> {
        let Some(test_command) = self.config.test_command.clone() else {
            return Ok(());
        };
        self.ui.banner("finalize: running project checks");

        for round in 1..=MAX_FINALIZE_ROUNDS {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&test_command)
                .current_dir(&self.config.project_dir)
                .output()
                .await
                .with_context(|| format!("Failed to run test command: {}", test_command))?;

            if output.status.success() {
                self.ui.note("checks passed");
                return self.integration_review().await;
            }

            let tail = output_tail(&output.stdout, &output.stderr);
            warn!(round, "finalize checks failed");
            self.log.append(&Event::new(
                EventKind::FinalizeRound,
                0,
                "finalize",
                json!({ "round": round, "command": test_command }),
            ))?;
            if round == MAX_FINALIZE_ROUNDS {
                return Err(anyhow!(
                    "Checks still failing after {} fix rounds: {}",
                    MAX_FINALIZE_ROUNDS,
                    test_command
                ));
            }

            self.ui
                .warn(&format!("checks failed, fix round {} of {}", round, MAX_FINALIZE_ROUNDS - 1));
            let instruction = format!(
                "The project checks (`{}`) fail after integrating recent work. \
                 Diagnose and fix the failures, then re-run the checks.\n\n\
                 Recent output:\n{}",
                test_command, tail
            );
            let settings = self.config.phase_settings(Phase::Implement);
            let result = self
                .invoker
                .invoke(
                    0,
                    Phase::Implement,
                    &settings,
                    &instruction,
                    round,
                    &self.log,
                    &self.status,
                    None,
                )
                .await?;
            if !result.succeeded() {
                warn!(round, exit_code = result.exit_code, "finalize fix round failed");
            }
        }
        unreachable!("finalize loop returns within the round budget");
    }

    /// One review pass over the integrated target branch. Findings get a
    /// single fix invocation; leftovers are logged, not fatal, since every
    /// epic already passed its own pre-submission review.
    async fn integration_review(&self) -> Result<()> {
        let Some(reviewer) = &self.reviewer else {
            return Ok(());
        };
        let report = reviewer.review(&self.config.target_branch).await?;
        self.log.append(&Event::new(
            EventKind::ReviewRound,
            0,
            "finalize",
            json!({ "source": "reviewer", "findings": report.count() }),
        ))?;
        if report.is_clean() {
            self.ui.note("integration review clean");
            return Ok(());
        }

        self.ui
            .warn(&format!("integration review: {} findings", report.count()));
        let instruction = format!(
            "A review of the integrated branch `{}` reported the findings \
             below. Address each one, or note in the code why it does not \
             apply.\n\n{}",
            self.config.target_branch,
            report.as_text()
        );
        let settings = self.config.phase_settings(Phase::Review);
        let result = self
            .invoker
            .invoke(
                0,
                Phase::Review,
                &settings,
                &instruction,
                1,
                &self.log,
                &self.status,
                None,
            )
            .await?;
        if !result.succeeded() {
            warn!(exit_code = result.exit_code, "integration review fix failed");
        }
        Ok(())
    }

    /// Per-epic summary rebuilt from the durable event log.
    fn write_summary(&self, epic: &Epic) -> Result<()> {
        let cost = self.log.epic_cost(epic.id)?;
        let timings = self.log.epic_timings(epic.id)?;
        let total_secs: f64 = timings.iter().map(|(_, s)| s).sum();

        let mut body = format!(
            "# Epic {:03}: {}\n\nbranch: {}\ncost: ${:.4}\nwall time: {:.0}s\n\n| phase | seconds |\n|---|---|\n",
            epic.id,
            epic.title,
            epic.branch_name.as_deref().unwrap_or("-"),
            cost,
            total_secs,
        );
        for (phase, secs) in &timings {
            body.push_str(&format!("| {} | {:.0} |\n", phase, secs));
        }

        let path = self
            .config
            .summaries_dir
            .join(format!("epic-{:03}.md", epic.id));
        fs::create_dir_all(&self.config.summaries_dir)?;
        fs::write(&path, body)
            .with_context(|| format!("Failed to write summary: {}", path.display()))?;
        info!(epic = epic.id, path = %path.display(), "summary written");
        Ok(())
    }

    /// Whole-run summary across every epic touched by this invocation.
    fn write_project_summary(&self, report: &RunReport) -> Result<()> {
        let mut body = String::from("# Run summary\n\n| epic | cost | wall time |\n|---|---|---|\n");
        let mut total_cost = 0.0;
        let mut total_secs = 0.0;
        for id in &report.merged {
            let cost = self.log.epic_cost(*id).unwrap_or_default();
            let secs: f64 = self
                .log
                .epic_timings(*id)
                .unwrap_or_default()
                .iter()
                .map(|(_, s)| s)
                .sum();
            total_cost += cost;
            total_secs += secs;
            body.push_str(&format!("| {:03} | ${:.4} | {:.0}s |\n", id, cost, secs));
        }
        for id in &report.skipped {
            body.push_str(&format!("| {:03} | skipped | - |\n", id));
        }
        body.push_str(&format!(
            "\ntotal: ${:.4} over {:.0}s ({} merged, {} skipped)\n",
            total_cost,
            total_secs,
            report.merged.len(),
            report.skipped.len()
        ));

        let path = self.config.summaries_dir.join("run.md");
        fs::create_dir_all(&self.config.summaries_dir)?;
        fs::write(&path, body)
            .with_context(|| format!("Failed to write run summary: {}", path.display()))?;
        info!(path = %path.display(), "run summary written");
        Ok(())
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.config.assume_yes || !console::user_attended() {
            return Ok(true);
        }
        Ok(dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()?)
    }
}

fn output_tail(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(stderr));
    let lines: Vec<&str> = combined.lines().collect();
    let start = lines.len().saturating_sub(40);
    lines[start..].join("\n")
}
