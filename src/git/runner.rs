use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

use crate::config::MergeStrategy;
use crate::error::{ArmadaError, Result};

/// Process-wide lock serializing git-mutating operations across the merge
/// queue, reconciler cleanup, and finalization. Read-only operations do not
/// take it.
#[derive(Clone, Default)]
pub struct GitMutex {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl GitMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

/// Outcome of a single merge attempt in the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Success,
    /// Conflicted paths from porcelain status.
    Conflict { files: Vec<String> },
    /// Non-conflict failure with the git diagnostic.
    Failed { message: String },
}

pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArmadaError::Git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(output)
    }

    /// Best-effort command used by cleanup paths; failures are logged at
    /// debug and swallowed.
    pub async fn run_best_effort(&self, args: &[&str]) {
        match self.run(args).await {
            Ok(output) if !output.status.success() => {
                debug!(args = ?args, "Best-effort git command failed");
            }
            Err(e) => {
                debug!(args = ?args, error = %e, "Best-effort git command errored");
            }
            Ok(_) => {}
        }
    }

    // --- state hygiene ----------------------------------------------------

    /// Return the working copy to a clean checkout of `main_branch`: abort
    /// any in-progress merge or rebase, hard-reset, drop untracked files,
    /// delete stale scratch branches, and check out the mainline.
    pub async fn ensure_clean_state(&self, main_branch: &str, temp_prefix: &str) -> Result<()> {
        self.run_best_effort(&["merge", "--abort"]).await;
        self.run_best_effort(&["rebase", "--abort"]).await;
        self.run_best_effort(&["reset", "--hard", "HEAD"]).await;
        self.run_best_effort(&["clean", "-fd"]).await;

        for branch in self.local_branches_with_prefix(temp_prefix).await? {
            self.run_best_effort(&["branch", "-D", &branch]).await;
        }

        self.run_checked(&["checkout", main_branch]).await?;
        Ok(())
    }

    pub async fn local_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .run(&["branch", "--list", &format!("{}*", prefix)])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|l| l.trim().trim_start_matches("* ").to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    // --- fetch / branch ---------------------------------------------------

    pub async fn fetch_branch(&self, branch: &str) {
        self.run_best_effort(&["fetch", "origin", branch]).await;
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    pub async fn create_branch_at(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run_checked(&["checkout", "-b", branch, start_point])
            .await?;
        Ok(())
    }

    pub async fn delete_local_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    pub async fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&[
                "rev-parse",
                "--verify",
                &format!("refs/remotes/origin/{}", branch),
            ])
            .await?;
        Ok(output.status.success())
    }

    // --- merge / rebase ---------------------------------------------------

    /// Attempt to merge `source` into the current branch with the given
    /// strategy. Conflicts are detected from porcelain status; the caller
    /// decides whether to abort or resolve.
    pub async fn merge_with_strategy(
        &self,
        strategy: MergeStrategy,
        source: &str,
        message: &str,
    ) -> Result<MergeAttempt> {
        let output = match strategy {
            MergeStrategy::FastForward => self.run(&["merge", "--ff-only", source]).await?,
            MergeStrategy::Rebase => {
                // Rebase integration: replay the source branch's commits on
                // top of the current branch, then fast-forward to them.
                return self.rebase_merge(source).await;
            }
            MergeStrategy::MergeCommit => {
                self.run(&["merge", "--no-ff", source, "-m", message]).await?
            }
        };

        if output.status.success() {
            return Ok(MergeAttempt::Success);
        }

        let conflicted = self.conflicted_files().await?;
        if !conflicted.is_empty() {
            return Ok(MergeAttempt::Conflict { files: conflicted });
        }

        Ok(MergeAttempt::Failed {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn rebase_merge(&self, source: &str) -> Result<MergeAttempt> {
        let head = self.current_branch().await?;

        let checkout = self.run(&["checkout", source]).await?;
        if !checkout.status.success() {
            return Ok(MergeAttempt::Failed {
                message: String::from_utf8_lossy(&checkout.stderr).trim().to_string(),
            });
        }

        let rebase = self.run(&["rebase", &head]).await?;
        if !rebase.status.success() {
            let conflicted = self.conflicted_files().await?;
            self.run_best_effort(&["rebase", "--abort"]).await;
            self.run_best_effort(&["checkout", &head]).await;
            if !conflicted.is_empty() {
                return Ok(MergeAttempt::Conflict { files: conflicted });
            }
            return Ok(MergeAttempt::Failed {
                message: String::from_utf8_lossy(&rebase.stderr).trim().to_string(),
            });
        }

        let rebased_tip = self.rev_parse("HEAD").await?;
        self.run_checked(&["checkout", &head]).await?;
        let ff = self.run(&["merge", "--ff-only", &rebased_tip]).await?;
        if ff.status.success() {
            Ok(MergeAttempt::Success)
        } else {
            Ok(MergeAttempt::Failed {
                message: String::from_utf8_lossy(&ff.stderr).trim().to_string(),
            })
        }
    }

    /// Rebase `branch` onto `onto` inside a scratch branch, leaving the
    /// working copy on the scratch branch when successful.
    pub async fn rebase_out_of_line(
        &self,
        branch: &str,
        onto: &str,
        temp_branch: &str,
    ) -> Result<MergeAttempt> {
        self.run_best_effort(&["branch", "-D", temp_branch]).await;
        let source = if self.remote_branch_exists(branch).await? {
            format!("origin/{}", branch)
        } else {
            branch.to_string()
        };
        self.run_checked(&["checkout", "-b", temp_branch, &source])
            .await?;

        let rebase = self.run(&["rebase", onto]).await?;
        if rebase.status.success() {
            return Ok(MergeAttempt::Success);
        }

        let conflicted = self.conflicted_files().await?;
        self.run_best_effort(&["rebase", "--abort"]).await;
        if !conflicted.is_empty() {
            Ok(MergeAttempt::Conflict { files: conflicted })
        } else {
            Ok(MergeAttempt::Failed {
                message: String::from_utf8_lossy(&rebase.stderr).trim().to_string(),
            })
        }
    }

    pub async fn abort_merge(&self) {
        self.run_best_effort(&["merge", "--abort"]).await;
    }

    // --- push -------------------------------------------------------------

    pub async fn push(&self, branch: &str) -> Result<()> {
        self.run_checked(&["push", "origin", branch]).await?;
        Ok(())
    }

    pub async fn push_force_to(&self, local_ref: &str, remote_branch: &str) -> Result<()> {
        self.run_checked(&[
            "push",
            "--force",
            "origin",
            &format!("{}:refs/heads/{}", local_ref, remote_branch),
        ])
        .await?;
        Ok(())
    }

    pub async fn push_delete(&self, branch: &str) {
        self.run_best_effort(&["push", "origin", "--delete", branch])
            .await;
    }

    // --- read-only queries ------------------------------------------------

    pub async fn current_branch(&self) -> Result<String> {
        let output = self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = self.run_checked(&["rev-parse", rev]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Flat file tree of the working copy.
    pub async fn ls_files(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&["ls-files"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    pub async fn recent_commits(&self, limit: usize) -> Result<String> {
        let output = self
            .run(&["log", &format!("-{}", limit), "--oneline"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn diff_shortstat(&self, base: &str) -> Result<String> {
        let output = self.run(&["diff", "--shortstat", base]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Conflicted paths from `status --porcelain`: both-modified (UU),
    /// both-added (AA), and the add/delete combinations.
    pub async fn conflicted_files(&self) -> Result<Vec<String>> {
        let output = self.run(&["status", "--porcelain"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let code = line.get(..2)?;
                let conflicted = matches!(code, "UU" | "AA" | "DD" | "AU" | "UA" | "DU" | "UD");
                if conflicted {
                    Some(line[3..].trim().to_string())
                } else {
                    None
                }
            })
            .collect())
    }

    /// Files containing unresolved conflict markers, limited to common
    /// source extensions.
    pub async fn conflict_marker_files(&self) -> Result<Vec<String>> {
        let output = self
            .run(&[
                "grep",
                "-l",
                "<<<<<<< ",
                "--",
                "*.ts",
                "*.tsx",
                "*.js",
                "*.jsx",
                "*.rs",
                "*.py",
                "*.go",
                "*.java",
                "*.c",
                "*.cc",
                "*.cpp",
                "*.h",
                "*.css",
                "*.html",
                "*.json",
                "*.md",
            ])
            .await?;
        // git grep exits 1 on no matches; treat that as empty.
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    pub async fn head_commit_count(&self) -> Result<u64> {
        let output = self.run(&["rev-list", "--count", "HEAD"]).await?;
        if !output.status.success() {
            return Ok(0);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .unwrap_or(0))
    }
}
