//! Code-host capability boundary.
//!
//! Pull-request lifecycle operations live behind the `CodeHost` trait so the
//! integration pipeline can run against a fake in tests and degrade to a
//! local merge when no host tooling is installed. The production adapter
//! shells out to the `gh` CLI and reads its JSON output.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Identifier for an open pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Aggregate review decision on a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    /// No decision yet; the pipeline keeps polling.
    Pending,
}

/// Host-side mergeability. `Unknown` means the host has not finished
/// computing it; poll again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mergeable {
    Ready,
    Conflicted,
    Unknown,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Whether the host tooling is usable here; false routes the pipeline
    /// to the local-merge fallback.
    async fn available(&self) -> bool;

    /// Return the open PR for `branch`, creating one if none exists.
    async fn find_or_create_pr(
        &self,
        branch: &str,
        target: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;

    async fn review_state(&self, pr: &PullRequest) -> Result<ReviewState>;

    /// Unresolved review comment bodies, for the fix instruction.
    async fn review_findings(&self, pr: &PullRequest) -> Result<Vec<String>>;

    async fn mergeable(&self, pr: &PullRequest) -> Result<Mergeable>;

    /// Merge the PR on the host (squash), deleting the remote branch.
    async fn merge(&self, pr: &PullRequest) -> Result<()>;
}

/// Production adapter over the `gh` CLI.
pub struct GhHost {
    workdir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PrView {
    number: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrStatus {
    review_decision: Option<String>,
    mergeable: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrComment {
    body: String,
}

#[derive(Debug, Deserialize)]
struct PrComments {
    comments: Vec<PrComment>,
    reviews: Vec<PrComment>,
}

impl GhHost {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }

    async fn gh(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "gh");
        Command::new("gh")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .context("Failed to run gh")
    }

    async fn gh_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.gh(args).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        serde_json::from_slice(&output.stdout).context("Unexpected gh JSON output")
    }
}

#[async_trait]
impl CodeHost for GhHost {
    async fn available(&self) -> bool {
        match self.gh(&["auth", "status"]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn find_or_create_pr(
        &self,
        branch: &str,
        target: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        // An existing open PR for the branch wins; create is not idempotent.
        if let Ok(view) = self
            .gh_json::<PrView>(&["pr", "view", branch, "--json", "number,url"])
            .await
        {
            return Ok(PullRequest {
                number: view.number,
                url: view.url,
            });
        }

        let output = self
            .gh(&[
                "pr", "create", "--head", branch, "--base", target, "--title", title, "--body",
                body,
            ])
            .await?;
        if !output.status.success() {
            return Err(anyhow!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let view: PrView = self
            .gh_json(&["pr", "view", branch, "--json", "number,url"])
            .await?;
        Ok(PullRequest {
            number: view.number,
            url: view.url,
        })
    }

    async fn review_state(&self, pr: &PullRequest) -> Result<ReviewState> {
        let number = pr.number.to_string();
        let status: PrStatus = self
            .gh_json(&["pr", "view", &number, "--json", "reviewDecision,mergeable"])
            .await?;
        Ok(match status.review_decision.as_deref() {
            Some("APPROVED") => ReviewState::Approved,
            Some("CHANGES_REQUESTED") => ReviewState::ChangesRequested,
            _ => ReviewState::Pending,
        })
    }

    async fn review_findings(&self, pr: &PullRequest) -> Result<Vec<String>> {
        let number = pr.number.to_string();
        let comments: PrComments = self
            .gh_json(&["pr", "view", &number, "--json", "comments,reviews"])
            .await?;
        Ok(comments
            .reviews
            .into_iter()
            .chain(comments.comments)
            .map(|c| c.body)
            .filter(|b| !b.trim().is_empty())
            .collect())
    }

    async fn mergeable(&self, pr: &PullRequest) -> Result<Mergeable> {
        let number = pr.number.to_string();
        let status: PrStatus = self
            .gh_json(&["pr", "view", &number, "--json", "reviewDecision,mergeable"])
            .await?;
        Ok(match status.mergeable.as_deref() {
            Some("MERGEABLE") => Mergeable::Ready,
            Some("CONFLICTING") => Mergeable::Conflicted,
            _ => Mergeable::Unknown,
        })
    }

    async fn merge(&self, pr: &PullRequest) -> Result<()> {
        let number = pr.number.to_string();
        let output = self
            .gh(&["pr", "merge", &number, "--squash", "--delete-branch"])
            .await?;
        if !output.status.success() {
            return Err(anyhow!(
                "gh pr merge failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}
