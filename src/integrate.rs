//! Integration pipeline: from a finished branch to a merged epic.
//!
//! Order of operations is load-bearing. The branch is reviewed and rebased
//! before anything leaves the machine, the merge is recorded in the epic
//! document before any cleanup, and every worker-assisted fix round flows
//! through the same invoker and event log as the lifecycle phases.

use crate::config::Config;
use crate::epic::{Epic, STATUS_MERGED};
use crate::errors::PipelineError;
use crate::events::{Event, EventKind, EventLog};
use crate::host::{CodeHost, Mergeable, PullRequest, ReviewState};
use crate::phase::Phase;
use crate::prompts::PromptProvider;
use crate::retry::{Attempt, Backoff, RetryPolicy, RunOutcome, run_attempts};
use crate::review::Reviewer;
use crate::status::StatusFile;
use crate::vcs::{PushOutcome, RebaseOutcome, VersionControl};
use crate::worker::WorkerInvoker;
use anyhow::{Result, anyhow};
use serde_json::json;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Worker-assisted conflict resolution rounds before a rebase is abandoned.
const MAX_CONFLICT_ROUNDS: u32 = 3;
/// Pre-submission review fix rounds before stall policy applies.
const MAX_REVIEW_ROUNDS: u32 = 5;
/// Host review polling budget; with the linear backoff this spans roughly
/// an hour before the timeout policy applies.
const MAX_APPROVAL_POLLS: u32 = 40;
const APPROVAL_BACKOFF: Duration = Duration::from_secs(15);
/// Mergeability is usually computed within seconds; short exponential poll.
const MAX_MERGEABLE_POLLS: u32 = 8;
const MERGEABLE_BACKOFF: Duration = Duration::from_secs(2);

pub struct IntegrationPipeline {
    config: Config,
    invoker: WorkerInvoker,
    prompts: Arc<dyn PromptProvider>,
    vcs: Arc<dyn VersionControl>,
    host: Arc<dyn CodeHost>,
    reviewer: Option<Arc<dyn Reviewer>>,
    log: EventLog,
    status: StatusFile,
}

impl IntegrationPipeline {
    pub fn new(
        config: Config,
        prompts: Arc<dyn PromptProvider>,
        vcs: Arc<dyn VersionControl>,
        host: Arc<dyn CodeHost>,
        reviewer: Option<Arc<dyn Reviewer>>,
    ) -> Self {
        let log = EventLog::new(config.events_file.clone());
        let status = StatusFile::new(config.status_file.clone());
        let invoker = WorkerInvoker::new(config.clone());
        Self {
            config,
            invoker,
            prompts,
            vcs,
            host,
            reviewer,
            log,
            status,
        }
    }

    /// Take `epic`'s branch through review, rebase, and merge. On success the
    /// epic document reads `status: merged` and the working tree sits on the
    /// target branch.
    pub async fn integrate(&self, epic: &mut Epic) -> Result<(), PipelineError> {
        let branch = epic
            .branch_name
            .clone()
            .ok_or_else(|| anyhow!("Epic {} has no branch to integrate", epic.id))?;

        info!(epic = epic.id, branch, "starting integration");
        self.vcs.checkout(&branch).await?;

        // Without a remote and a usable host nothing below applies; the
        // unconditional fallback is a plain local merge.
        if !self.vcs.has_remote() || !self.host.available().await {
            info!(epic = epic.id, "no usable code host; merging locally");
            return self.merge_locally(epic, &branch).await;
        }

        self.presubmission_review(epic, &branch).await?;
        self.rebase_onto_target(epic, &branch).await?;
        self.run_checks(epic).await?;

        self.push(epic, &branch).await?;
        let pr = self
            .host
            .find_or_create_pr(
                &branch,
                &self.config.target_branch,
                &epic.title,
                &pr_body(epic),
            )
            .await?;
        self.log.append(&Event::new(
            EventKind::PrOpened,
            epic.id,
            Phase::Review.slug(),
            json!({ "number": pr.number, "url": pr.url }),
        ))?;

        self.await_approval(epic, &pr, &branch).await?;
        self.await_mergeable(epic, &pr, &branch).await?;

        self.host
            .merge(&pr)
            .await
            .map_err(|e| PipelineError::MergeFailed {
                branch: branch.clone(),
                reason: e.to_string(),
            })?;

        self.record_merged_then_clean(epic, &branch).await
    }

    /// Loop the configured reviewer over the branch, feeding findings back
    /// into fix invocations until the report is clean or the counts plateau.
    async fn presubmission_review(&self, epic: &Epic, branch: &str) -> Result<(), PipelineError> {
        let Some(reviewer) = &self.reviewer else {
            return Ok(());
        };

        let mut counts: Vec<u32> = Vec::new();
        for round in 1..=MAX_REVIEW_ROUNDS {
            let report = reviewer.review(branch).await?;
            counts.push(report.count());
            self.log.append(&Event::new(
                EventKind::ReviewRound,
                epic.id,
                Phase::Review.slug(),
                json!({ "source": "reviewer", "round": round, "findings": report.count() }),
            ))?;

            if report.is_clean() {
                return Ok(());
            }
            if crate::converge::is_stalled(&counts, 2) {
                return self.handle_review_stall(epic, report.count());
            }

            let instruction = self.prompts.fix_instruction(epic, &report.as_text());
            self.fix_invocation(epic, &instruction, round).await?;
        }

        // Budget spent without a clean report; the last count decides.
        let last = counts.last().copied().unwrap_or(0);
        if last == 0 {
            return Ok(());
        }
        self.handle_review_stall(epic, last)
    }

    fn handle_review_stall(&self, epic: &Epic, findings: u32) -> Result<(), PipelineError> {
        if self.config.force_advance_on_review_stall {
            warn!(
                epic = epic.id,
                findings, "review findings plateaued; proceeding by policy"
            );
            return Ok(());
        }
        Err(PipelineError::ReviewStalled { findings })
    }

    /// Rebase the branch onto the freshest target, resolving conflicts with
    /// bounded worker assistance.
    async fn rebase_onto_target(&self, epic: &Epic, branch: &str) -> Result<(), PipelineError> {
        let target = self.config.target_branch.clone();
        let rebase_ref = if self.vcs.has_remote() {
            self.vcs.fetch(&target).await?;
            format!("origin/{}", target)
        } else {
            target
        };

        // Target already contained in the branch: nothing to replay.
        if self.vcs.is_ancestor(&rebase_ref, branch).await? {
            return Ok(());
        }

        let mut outcome = self.vcs.rebase_onto(&rebase_ref).await?;
        let mut rounds = 0;
        while let RebaseOutcome::Conflicts(paths) = outcome {
            rounds += 1;
            if rounds > MAX_CONFLICT_ROUNDS {
                self.vcs.abort_rebase().await?;
                return Err(PipelineError::RebaseUnresolved {
                    attempts: MAX_CONFLICT_ROUNDS,
                    paths,
                });
            }
            warn!(epic = epic.id, branch, round = rounds, ?paths, "rebase conflicts");
            self.log.append(&Event::new(
                EventKind::RebaseConflict,
                epic.id,
                Phase::Review.slug(),
                json!({ "round": rounds, "paths": paths }),
            ))?;

            let instruction = self.prompts.conflict_instruction(epic, &paths);
            self.fix_invocation(epic, &instruction, rounds).await?;
            outcome = self.vcs.continue_rebase().await?;
        }
        Ok(())
    }

    /// Run the project's test command against the rebased branch. One fix
    /// invocation on failure, then one re-run; a second failure is fatal.
    async fn run_checks(&self, epic: &Epic) -> Result<(), PipelineError> {
        let Some(command) = self.config.test_command.clone() else {
            return Ok(());
        };
        for attempt in 1..=2u32 {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&self.config.project_dir)
                .output()
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            if output.status.success() {
                return Ok(());
            }
            if attempt == 2 {
                return Err(PipelineError::Other(anyhow!(
                    "Checks still failing after rebase fix round: {}",
                    command
                )));
            }
            warn!(epic = epic.id, %command, "checks failed after rebase");
            let tail = String::from_utf8_lossy(&output.stderr);
            let instruction = self.prompts.fix_instruction(
                epic,
                &format!("The project checks (`{}`) fail on this branch:\n{}", command, tail),
            );
            self.fix_invocation(epic, &instruction, attempt).await?;
        }
        Ok(())
    }

    /// Push with a lease; one rebase-and-retry on rejection, then give up.
    async fn push(&self, epic: &Epic, branch: &str) -> Result<(), PipelineError> {
        match self.vcs.push_with_lease(branch).await? {
            PushOutcome::Pushed => Ok(()),
            PushOutcome::Rejected => {
                warn!(epic = epic.id, branch, "push lease rejected; rebasing once more");
                self.rebase_onto_target(epic, branch).await?;
                match self.vcs.push_with_lease(branch).await? {
                    PushOutcome::Pushed => Ok(()),
                    PushOutcome::Rejected => Err(PipelineError::PushRejected {
                        branch: branch.to_string(),
                    }),
                }
            }
        }
    }

    /// Poll the host until the PR is approved. Requested changes trigger a
    /// fix invocation and a fresh push before polling resumes, with the same
    /// plateau detection as pre-submission review; a polling timeout proceeds
    /// without approval rather than abandoning a finished branch.
    async fn await_approval(
        &self,
        epic: &Epic,
        pr: &PullRequest,
        branch: &str,
    ) -> Result<(), PipelineError> {
        let counts: RefCell<Vec<u32>> = RefCell::new(Vec::new());
        let counts = &counts;
        let policy = RetryPolicy::force_advance(MAX_APPROVAL_POLLS)
            .with_backoff(Backoff::Linear(APPROVAL_BACKOFF));
        let outcome = run_attempts(&policy, "pr-approval", |round| async move {
            match self.host.review_state(pr).await? {
                ReviewState::Approved => Ok(Attempt::Done(None)),
                ReviewState::Pending => Ok(Attempt::Retry),
                ReviewState::ChangesRequested => {
                    let findings = self.host.review_findings(pr).await?;
                    counts.borrow_mut().push(findings.len() as u32);
                    self.log.append(&Event::new(
                        EventKind::ReviewRound,
                        epic.id,
                        Phase::Review.slug(),
                        json!({ "source": "host", "round": round, "findings": findings.len() }),
                    ))?;
                    if crate::converge::is_stalled(&counts.borrow(), 2) {
                        return Ok(Attempt::Done(Some(findings.len() as u32)));
                    }
                    let instruction = self.prompts.fix_instruction(epic, &findings.join("\n"));
                    self.fix_invocation(epic, &instruction, round)
                        .await
                        .map_err(|e| anyhow!(e))?;
                    if let PushOutcome::Rejected = self.vcs.push_with_lease(branch).await? {
                        return Err(anyhow!("Push rejected while addressing review"));
                    }
                    Ok(Attempt::Retry)
                }
            }
        })
        .await?;

        match outcome {
            RunOutcome::Completed(None) => Ok(()),
            RunOutcome::Completed(Some(findings)) => {
                warn!(
                    epic = epic.id,
                    pr = pr.number,
                    findings,
                    "host review findings plateaued"
                );
                self.handle_review_stall(epic, findings)
            }
            RunOutcome::Exhausted(_) => {
                warn!(
                    epic = epic.id,
                    pr = pr.number,
                    "approval polling timed out; proceeding to merge checks"
                );
                Ok(())
            }
        }
    }

    /// Poll until the host reports the PR mergeable. A conflicted report
    /// sends the branch back through rebase and push.
    async fn await_mergeable(
        &self,
        epic: &Epic,
        pr: &PullRequest,
        branch: &str,
    ) -> Result<(), PipelineError> {
        let policy = RetryPolicy::fatal(MAX_MERGEABLE_POLLS)
            .with_backoff(Backoff::Exponential(MERGEABLE_BACKOFF));
        let outcome = run_attempts(&policy, "pr-mergeable", |_| async move {
            match self.host.mergeable(pr).await? {
                Mergeable::Ready => Ok(Attempt::Done(())),
                Mergeable::Unknown => Ok(Attempt::Retry),
                Mergeable::Conflicted => {
                    self.rebase_onto_target(epic, branch)
                        .await
                        .map_err(|e| anyhow!(e))?;
                    if let PushOutcome::Rejected = self.vcs.push_with_lease(branch).await? {
                        return Err(anyhow!("Push rejected after conflict rebase"));
                    }
                    Ok(Attempt::Retry)
                }
            }
        })
        .await?;

        match outcome {
            RunOutcome::Completed(()) => Ok(()),
            RunOutcome::Exhausted(_) => Err(PipelineError::Other(anyhow!(
                "PR #{} never became mergeable after {} polls",
                pr.number,
                MAX_MERGEABLE_POLLS
            ))),
        }
    }

    /// Fallback when no host is usable: merge into the target locally.
    async fn merge_locally(&self, epic: &mut Epic, branch: &str) -> Result<(), PipelineError> {
        let target = self.config.target_branch.clone();
        self.vcs.checkout(&target).await?;
        self.vcs
            .merge_no_ff(branch, &format!("Merge {} ({})", branch, epic.title))
            .await
            .map_err(|e| PipelineError::MergeFailed {
                branch: branch.to_string(),
                reason: e.to_string(),
            })?;
        self.record_merged_then_clean(epic, branch).await
    }

    /// Record the merge, then clean up. The recording comes first so a failed
    /// checkout or pull can never leave a merged epic looking unmerged.
    async fn record_merged_then_clean(
        &self,
        epic: &mut Epic,
        branch: &str,
    ) -> Result<(), PipelineError> {
        self.log.append(&Event::new(
            EventKind::Merged,
            epic.id,
            Phase::Review.slug(),
            json!({ "branch": branch }),
        ))?;
        epic.set_status(STATUS_MERGED)?;
        info!(epic = epic.id, branch, "epic merged");

        let target = self.config.target_branch.clone();
        self.vcs.checkout(&target).await?;
        if self.vcs.has_remote() {
            self.vcs.pull(&target).await?;
        }
        Ok(())
    }

    /// One worker round addressing review findings or rebase conflicts. Runs
    /// with the review phase's settings; a failed round is logged and the
    /// caller's loop decides what happens next.
    async fn fix_invocation(&self, epic: &Epic, instruction: &str, round: u32) -> Result<()> {
        let settings = self.config.phase_settings(Phase::Review);
        let result = self
            .invoker
            .invoke(
                epic.id,
                Phase::Review,
                &settings,
                instruction,
                round,
                &self.log,
                &self.status,
                None,
            )
            .await
            .map_err(anyhow::Error::from)?;
        if !result.succeeded() {
            warn!(
                epic = epic.id,
                round,
                exit_code = result.exit_code,
                "fix invocation did not report success"
            );
        }
        Ok(())
    }
}

fn pr_body(epic: &Epic) -> String {
    format!(
        "Automated integration of epic {:03}: {}\n\nSource: {}\n",
        epic.id,
        epic.title,
        epic.source_file.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::ReviewReport;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeVcs {
        remote: bool,
        fail_target_checkout: bool,
        rebase_outcomes: Mutex<VecDeque<RebaseOutcome>>,
        continue_outcomes: Mutex<VecDeque<RebaseOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeVcs {
        fn new(remote: bool) -> Self {
            Self {
                remote,
                fail_target_checkout: false,
                rebase_outcomes: Mutex::new(VecDeque::new()),
                continue_outcomes: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VersionControl for FakeVcs {
        async fn current_branch(&self) -> Result<String> {
            Ok("001-demo".to_string())
        }
        async fn checkout(&self, branch: &str) -> Result<()> {
            self.record(format!("checkout {}", branch));
            if self.fail_target_checkout && branch == "main" {
                return Err(anyhow!("disk failure"));
            }
            Ok(())
        }
        async fn branch_exists(&self, _branch: &str) -> Result<bool> {
            Ok(true)
        }
        async fn fetch(&self, branch: &str) -> Result<()> {
            self.record(format!("fetch {}", branch));
            Ok(())
        }
        async fn is_ancestor(&self, _a: &str, _d: &str) -> Result<bool> {
            Ok(false)
        }
        async fn rebase_onto(&self, target: &str) -> Result<RebaseOutcome> {
            self.record(format!("rebase {}", target));
            Ok(self
                .rebase_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RebaseOutcome::Clean))
        }
        async fn abort_rebase(&self) -> Result<()> {
            self.record("abort-rebase");
            Ok(())
        }
        async fn continue_rebase(&self) -> Result<RebaseOutcome> {
            self.record("continue-rebase");
            Ok(self
                .continue_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RebaseOutcome::Clean))
        }
        async fn commit_all(&self, _message: &str) -> Result<()> {
            Ok(())
        }
        async fn push_with_lease(&self, branch: &str) -> Result<PushOutcome> {
            self.record(format!("push {}", branch));
            Ok(PushOutcome::Pushed)
        }
        async fn merge_no_ff(&self, branch: &str, _message: &str) -> Result<()> {
            self.record(format!("merge {}", branch));
            Ok(())
        }
        async fn pull(&self, branch: &str) -> Result<()> {
            self.record(format!("pull {}", branch));
            Ok(())
        }
        fn has_remote(&self) -> bool {
            self.remote
        }
    }

    struct FakeHost {
        review_states: Mutex<VecDeque<ReviewState>>,
        mergeable_states: Mutex<VecDeque<Mergeable>>,
        merged: Mutex<bool>,
    }

    impl FakeHost {
        fn approving() -> Self {
            Self {
                review_states: Mutex::new(VecDeque::new()),
                mergeable_states: Mutex::new(VecDeque::new()),
                merged: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl CodeHost for FakeHost {
        async fn available(&self) -> bool {
            true
        }
        async fn find_or_create_pr(
            &self,
            _branch: &str,
            _target: &str,
            _title: &str,
            _body: &str,
        ) -> Result<PullRequest> {
            Ok(PullRequest {
                number: 42,
                url: "https://example.test/pr/42".to_string(),
            })
        }
        async fn review_state(&self, _pr: &PullRequest) -> Result<ReviewState> {
            Ok(self
                .review_states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ReviewState::Approved))
        }
        async fn review_findings(&self, _pr: &PullRequest) -> Result<Vec<String>> {
            Ok(vec!["tighten error handling".to_string()])
        }
        async fn mergeable(&self, _pr: &PullRequest) -> Result<Mergeable> {
            Ok(self
                .mergeable_states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Mergeable::Ready))
        }
        async fn merge(&self, _pr: &PullRequest) -> Result<()> {
            *self.merged.lock().unwrap() = true;
            Ok(())
        }
    }

    struct ScriptedReviewer {
        counts: Mutex<VecDeque<u32>>,
    }

    impl ScriptedReviewer {
        fn new(counts: &[u32]) -> Self {
            Self {
                counts: Mutex::new(counts.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl Reviewer for ScriptedReviewer {
        async fn review(&self, _branch: &str) -> Result<ReviewReport> {
            let n = self.counts.lock().unwrap().pop_front().unwrap_or(0);
            Ok(ReviewReport {
                findings: (0..n).map(|i| format!("finding {}", i)).collect(),
            })
        }
    }

    fn setup(dir: &Path) -> (Config, Epic) {
        // A worker command that exits cleanly keeps fix invocations inert.
        fs::write(dir.join("drover.toml"), "worker_cmd = \"true\"\n").unwrap();
        let config = Config::new(dir.to_path_buf(), false, true).unwrap();
        config.ensure_directories().unwrap();

        let path = dir.join("epics").join("001-demo.md");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "---\nid: 1\nbranchName: 001-demo\n---\n# Demo\n\nBody.\n",
        )
        .unwrap();
        (config, Epic::load(&path).unwrap())
    }

    fn pipeline(
        config: Config,
        vcs: Arc<FakeVcs>,
        host: Arc<FakeHost>,
        reviewer: Option<Arc<dyn Reviewer>>,
    ) -> IntegrationPipeline {
        IntegrationPipeline::new(
            config,
            Arc::new(crate::prompts::DefaultPrompts),
            vcs,
            host,
            reviewer,
        )
    }

    #[tokio::test]
    async fn test_local_merge_when_no_remote() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(false));
        let host = Arc::new(FakeHost::approving());

        pipeline(config, vcs.clone(), host.clone(), None)
            .integrate(&mut epic)
            .await
            .unwrap();

        assert!(epic.is_merged());
        assert!(!*host.merged.lock().unwrap());
        let calls = vcs.calls();
        assert!(calls.contains(&"merge 001-demo".to_string()));
        // The host-less fallback goes straight to the merge.
        assert!(!calls.iter().any(|c| c.starts_with("rebase")));
        assert!(!calls.iter().any(|c| c.starts_with("push")));
    }

    #[tokio::test]
    async fn test_hostless_path_skips_review_entirely() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(false));
        let host = Arc::new(FakeHost::approving());
        // A reviewer that would stall forever must never run on this path.
        let reviewer: Arc<dyn Reviewer> = Arc::new(ScriptedReviewer::new(&[5, 5, 5, 5, 5]));

        pipeline(config, vcs.clone(), host, Some(reviewer))
            .integrate(&mut epic)
            .await
            .unwrap();

        assert!(epic.is_merged());
        assert!(vcs.calls().contains(&"merge 001-demo".to_string()));
    }

    #[tokio::test]
    async fn test_full_host_path_merges_and_records() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(true));
        let host = Arc::new(FakeHost::approving());

        let p = pipeline(config, vcs.clone(), host.clone(), None);
        p.integrate(&mut epic).await.unwrap();

        assert!(epic.is_merged());
        assert!(*host.merged.lock().unwrap());
        let calls = vcs.calls();
        assert!(calls.contains(&"rebase origin/main".to_string()));
        assert!(calls.contains(&"push 001-demo".to_string()));
        assert!(calls.contains(&"pull main".to_string()));

        let events = p.log.read_all().unwrap();
        assert!(events.iter().any(|e| e.event == EventKind::PrOpened));
        assert!(events.iter().any(|e| e.event == EventKind::Merged));
        // Status survives a reload of the document.
        assert!(Epic::load(&epic.source_file).unwrap().is_merged());
    }

    #[tokio::test]
    async fn test_review_stall_halts_by_default() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(true));
        let host = Arc::new(FakeHost::approving());
        let reviewer: Arc<dyn Reviewer> = Arc::new(ScriptedReviewer::new(&[2, 2]));

        let err = pipeline(config, vcs, host, Some(reviewer))
            .integrate(&mut epic)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ReviewStalled { findings: 2 }));
        assert!(!epic.is_merged());
    }

    #[tokio::test]
    async fn test_review_stall_proceeds_when_configured() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("drover.toml"),
            "worker_cmd = \"true\"\nforce_advance_on_review_stall = true\n",
        )
        .unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, true).unwrap();
        config.ensure_directories().unwrap();
        let path = dir.path().join("epics").join("001-demo.md");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "---\nid: 1\nbranchName: 001-demo\n---\n# Demo\n",
        )
        .unwrap();
        let mut epic = Epic::load(&path).unwrap();

        let vcs = Arc::new(FakeVcs::new(true));
        let host = Arc::new(FakeHost::approving());
        let reviewer: Arc<dyn Reviewer> = Arc::new(ScriptedReviewer::new(&[2, 2]));

        pipeline(config, vcs, host, Some(reviewer))
            .integrate(&mut epic)
            .await
            .unwrap();
        assert!(epic.is_merged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_review_plateau_applies_stall_policy() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(true));
        let host = Arc::new(FakeHost::approving());
        // Two rounds of requested changes with the same finding count; the
        // fix cycle is making no progress and must stop rather than poll on.
        host.review_states.lock().unwrap().extend([
            ReviewState::ChangesRequested,
            ReviewState::ChangesRequested,
        ]);

        let err = pipeline(config, vcs.clone(), host, None)
            .integrate(&mut epic)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ReviewStalled { findings: 1 }));
        assert!(!epic.is_merged());
        // The publish push plus exactly one fix-round repush before the
        // plateau stopped the loop.
        let pushes = vcs.calls().iter().filter(|c| c.starts_with("push")).count();
        assert_eq!(pushes, 2);
    }

    #[tokio::test]
    async fn test_review_converges_after_fix_rounds() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(true));
        let host = Arc::new(FakeHost::approving());
        let reviewer: Arc<dyn Reviewer> = Arc::new(ScriptedReviewer::new(&[3, 1, 0]));

        let p = pipeline(config, vcs, host, Some(reviewer));
        p.integrate(&mut epic).await.unwrap();
        assert!(epic.is_merged());

        let rounds: Vec<_> = p
            .log
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.event == EventKind::ReviewRound)
            .collect();
        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds[2].payload["findings"], 0);
    }

    #[tokio::test]
    async fn test_unresolved_conflicts_abort_rebase() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(true));
        let conflict = RebaseOutcome::Conflicts(vec!["src/lib.rs".to_string()]);
        vcs.rebase_outcomes.lock().unwrap().push_back(conflict.clone());
        for _ in 0..MAX_CONFLICT_ROUNDS {
            vcs.continue_outcomes.lock().unwrap().push_back(conflict.clone());
        }
        let host = Arc::new(FakeHost::approving());

        let err = pipeline(config, vcs.clone(), host, None)
            .integrate(&mut epic)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RebaseUnresolved { .. }));
        assert!(vcs.calls().contains(&"abort-rebase".to_string()));
        assert!(!epic.is_merged());
    }

    #[tokio::test]
    async fn test_conflict_resolved_by_worker_round() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        let vcs = Arc::new(FakeVcs::new(true));
        vcs.rebase_outcomes
            .lock()
            .unwrap()
            .push_back(RebaseOutcome::Conflicts(vec!["src/a.rs".to_string()]));
        // continue_rebase defaults to Clean, modelling a successful fix.
        let host = Arc::new(FakeHost::approving());

        let p = pipeline(config, vcs.clone(), host, None);
        p.integrate(&mut epic).await.unwrap();
        assert!(epic.is_merged());
        assert!(vcs.calls().contains(&"continue-rebase".to_string()));
        assert!(
            p.log
                .read_all()
                .unwrap()
                .iter()
                .any(|e| e.event == EventKind::RebaseConflict)
        );
    }

    #[tokio::test]
    async fn test_merge_recorded_before_cleanup_failure() {
        let dir = tempdir().unwrap();
        let (config, mut epic) = setup(dir.path());
        // Host path: the only target-branch checkout is the post-merge
        // cleanup, so failing it exercises the ordering guarantee.
        let mut vcs = FakeVcs::new(true);
        vcs.fail_target_checkout = true;
        let host = Arc::new(FakeHost::approving());

        let result = pipeline(config, Arc::new(vcs), host.clone(), None)
            .integrate(&mut epic)
            .await;
        assert!(result.is_err());
        assert!(*host.merged.lock().unwrap());
        assert!(Epic::load(&epic.source_file).unwrap().is_merged());
    }
}
