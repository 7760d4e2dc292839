//! Version-control capability boundary.
//!
//! The engine and pipeline depend only on the `VersionControl` trait; the
//! production adapter mixes git2 for local repository queries with subprocess
//! git for the network-touching operations (fetch, rebase, push) whose
//! conflict and lease semantics the CLI expresses directly.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use git2::{Repository, Signature};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Result of rebasing the current branch onto a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    /// Target already contained in the branch; nothing to do.
    UpToDate,
    /// Rebase stopped; carries the conflicted paths.
    Conflicts(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The lease failed: remote moved since our last fetch.
    Rejected,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn current_branch(&self) -> Result<String>;
    async fn checkout(&self, branch: &str) -> Result<()>;
    async fn branch_exists(&self, branch: &str) -> Result<bool>;
    async fn fetch(&self, branch: &str) -> Result<()>;
    /// Merge-base ancestry: is `ancestor` already contained in `descendant`?
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;
    async fn rebase_onto(&self, target: &str) -> Result<RebaseOutcome>;
    async fn abort_rebase(&self) -> Result<()>;
    async fn continue_rebase(&self) -> Result<RebaseOutcome>;
    /// Stage everything and commit; no-op when the tree is clean.
    async fn commit_all(&self, message: &str) -> Result<()>;
    /// Push with a fencing lease so a stale local branch cannot clobber
    /// newer remote work.
    async fn push_with_lease(&self, branch: &str) -> Result<PushOutcome>;
    /// Local three-way merge with no fast-forward.
    async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()>;
    async fn pull(&self, branch: &str) -> Result<()>;
    /// Whether a remote is configured at all; gates the integration path.
    fn has_remote(&self) -> bool;
}

/// Production adapter over one working tree.
pub struct GitBackend {
    workdir: PathBuf,
}

impl GitBackend {
    pub fn open(workdir: &Path) -> Result<Self> {
        // Validate eagerly so a non-repo project dir fails preflight.
        Repository::open(workdir).context("Failed to open git repository")?;
        Ok(Self {
            workdir: workdir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.workdir).context("Failed to open git repository")
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .context("Failed to run git")
    }

    async fn git_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    async fn conflicted_paths(&self) -> Result<Vec<String>> {
        let output = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

#[async_trait]
impl VersionControl for GitBackend {
    async fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head().context("Failed to resolve HEAD")?;
        head.shorthand()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("HEAD is not on a branch"))
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.git_ok(&["checkout", branch]).await
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        Ok(repo.find_branch(branch, git2::BranchType::Local).is_ok())
    }

    async fn fetch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["fetch", "origin", branch]).await
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let repo = self.repo()?;
        let a = repo
            .revparse_single(ancestor)
            .with_context(|| format!("Unknown revision: {}", ancestor))?
            .id();
        let d = repo
            .revparse_single(descendant)
            .with_context(|| format!("Unknown revision: {}", descendant))?
            .id();
        Ok(repo.merge_base(a, d).map(|base| base == a).unwrap_or(false))
    }

    async fn rebase_onto(&self, target: &str) -> Result<RebaseOutcome> {
        let output = self.git(&["rebase", target]).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("up to date") {
                return Ok(RebaseOutcome::UpToDate);
            }
            return Ok(RebaseOutcome::Clean);
        }
        Ok(RebaseOutcome::Conflicts(self.conflicted_paths().await?))
    }

    async fn abort_rebase(&self) -> Result<()> {
        self.git_ok(&["rebase", "--abort"]).await
    }

    async fn continue_rebase(&self) -> Result<RebaseOutcome> {
        // Resolved paths must be staged before continuing.
        self.git_ok(&["add", "-A"]).await?;
        let output = self
            .git(&["-c", "core.editor=true", "rebase", "--continue"])
            .await?;
        if output.status.success() {
            return Ok(RebaseOutcome::Clean);
        }
        Ok(RebaseOutcome::Conflicts(self.conflicted_paths().await?))
    }

    async fn commit_all(&self, message: &str) -> Result<()> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        // Clean tree: nothing to record.
        if let Ok(head) = repo.head()
            && let Ok(parent) = head.peel_to_commit()
            && parent.tree_id() == tree_id
        {
            return Ok(());
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("drover", "drover@localhost")?;
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
        Ok(())
    }

    async fn push_with_lease(&self, branch: &str) -> Result<PushOutcome> {
        let output = self
            .git(&["push", "--force-with-lease", "origin", branch])
            .await?;
        if output.status.success() {
            return Ok(PushOutcome::Pushed);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("stale info") || stderr.contains("[rejected]") {
            return Ok(PushOutcome::Rejected);
        }
        Err(anyhow!("git push failed: {}", stderr.trim()))
    }

    async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.git_ok(&["merge", "--no-ff", "-m", message, branch])
            .await
    }

    async fn pull(&self, branch: &str) -> Result<()> {
        self.git_ok(&["pull", "origin", branch]).await
    }

    fn has_remote(&self) -> bool {
        self.repo()
            .map(|r| r.find_remote("origin").is_ok())
            .unwrap_or(false)
    }
}
