use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{MergeConfig, MergeStrategy};
use crate::git::{GitMutex, GitRunner, MergeAttempt};
use crate::utils::slugify;

/// What happened to one dequeued branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Conflict under the retry cap; branch was rebased out-of-line and
    /// re-enqueued at high priority.
    Skipped,
    /// Conflict with the retry cap exhausted; the conflict callback fired.
    Conflict,
    Failed,
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Merged => "merged",
            Self::Skipped => "skipped",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub branch: String,
    pub outcome: MergeOutcome,
    pub detail: String,
    pub conflicting_files: Vec<String>,
}

/// Payload for the conflict callback once retries are exhausted.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub branch: String,
    pub conflicting_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub total_merged: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub total_conflicts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    branch: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    queued: HashSet<String>,
    next_seq: u64,
}

type ResultCallback = Box<dyn Fn(&MergeResult) + Send + Sync>;
type ConflictCallback = Box<dyn Fn(&ConflictInfo) + Send + Sync>;

/// Serial integrator of completed branches into the mainline. At most one
/// merge executes at any instant; the background tick fully drains the queue
/// each cycle. All git mutation happens under the process-wide git mutex.
pub struct MergeQueue {
    git: GitRunner,
    git_mutex: GitMutex,
    config: MergeConfig,
    main_branch: String,

    inner: Mutex<QueueInner>,
    merged: RwLock<HashSet<String>>,
    retry_counts: Mutex<HashMap<String, u32>>,

    merged_count: AtomicU64,
    skipped_count: AtomicU64,
    failed_count: AtomicU64,
    conflict_count: AtomicU64,

    on_result: RwLock<Vec<ResultCallback>>,
    on_conflict: RwLock<Vec<ConflictCallback>>,

    running: AtomicBool,
}

impl MergeQueue {
    pub fn new(
        git: GitRunner,
        git_mutex: GitMutex,
        config: MergeConfig,
        main_branch: impl Into<String>,
    ) -> Self {
        Self {
            git,
            git_mutex,
            config,
            main_branch: main_branch.into(),
            inner: Mutex::new(QueueInner::default()),
            merged: RwLock::new(HashSet::new()),
            retry_counts: Mutex::new(HashMap::new()),
            merged_count: AtomicU64::new(0),
            skipped_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            conflict_count: AtomicU64::new(0),
            on_result: RwLock::new(Vec::new()),
            on_conflict: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn on_merge_result(&self, callback: ResultCallback) {
        self.on_result.write().push(callback);
    }

    pub fn on_conflict(&self, callback: ConflictCallback) {
        self.on_conflict.write().push(callback);
    }

    /// Admit a branch. Duplicates and already-merged branches are ignored;
    /// the first admission's priority wins.
    pub fn enqueue(&self, branch: &str, priority: i32) -> bool {
        if self.merged.read().contains(branch) {
            debug!(branch = %branch, "Branch already merged; not re-enqueued");
            return false;
        }

        let mut inner = self.inner.lock();
        if !inner.queued.insert(branch.to_string()) {
            debug!(branch = %branch, "Branch already queued; enqueue ignored");
            return false;
        }

        let entry = QueueEntry {
            priority,
            enqueued_at: Utc::now(),
            seq: inner.next_seq,
            branch: branch.to_string(),
        };
        inner.next_seq += 1;
        inner.heap.push(entry);
        debug!(branch = %branch, priority, "Branch enqueued for merge");
        true
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().queued.len()
    }

    pub fn is_branch_merged(&self, branch: &str) -> bool {
        self.merged.read().contains(branch)
    }

    pub fn retry_count(&self, branch: &str) -> u32 {
        self.retry_counts.lock().get(branch).copied().unwrap_or(0)
    }

    pub fn reset_retry_count(&self, branch: &str) {
        self.retry_counts.lock().remove(branch);
    }

    pub fn stats(&self) -> MergeStats {
        MergeStats {
            total_merged: self.merged_count.load(AtomicOrdering::Relaxed),
            total_skipped: self.skipped_count.load(AtomicOrdering::Relaxed),
            total_failed: self.failed_count.load(AtomicOrdering::Relaxed),
            total_conflicts: self.conflict_count.load(AtomicOrdering::Relaxed),
        }
    }

    fn pop_next(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        while let Some(entry) = inner.heap.pop() {
            if !inner.queued.remove(&entry.branch) {
                // Stale heap entry for a branch whose queued admission was
                // already consumed.
                continue;
            }
            if self.merged.read().contains(&entry.branch) {
                debug!(branch = %entry.branch, "Dropping already-merged branch from queue");
                continue;
            }
            return Some(entry.branch);
        }
        None
    }

    /// Process every queued branch, in (priority, enqueue-time) order,
    /// including branches re-enqueued by conflict retries along the way.
    pub async fn drain(&self) -> Vec<MergeResult> {
        let mut results = Vec::new();
        while let Some(branch) = self.pop_next() {
            let result = self.merge_branch(&branch).await;
            for callback in self.on_result.read().iter() {
                callback(&result);
            }
            results.push(result);
        }
        results
    }

    async fn merge_branch(&self, branch: &str) -> MergeResult {
        info!(branch = %branch, strategy = %self.config.strategy, "Merging branch");
        let _guard = self.git_mutex.lock().await;

        if let Err(e) = self
            .git
            .ensure_clean_state(&self.main_branch, &self.config.temp_branch_prefix)
            .await
        {
            self.failed_count.fetch_add(1, AtomicOrdering::Relaxed);
            return MergeResult {
                branch: branch.to_string(),
                outcome: MergeOutcome::Failed,
                detail: format!("failed to reach clean state: {}", e),
                conflicting_files: Vec::new(),
            };
        }

        self.git.fetch_branch(branch).await;
        let source = match self.git.remote_branch_exists(branch).await {
            Ok(true) => format!("origin/{}", branch),
            _ => branch.to_string(),
        };

        let message = format!("Merge {} into {}", branch, self.main_branch);
        let mut attempt = match self
            .git
            .merge_with_strategy(self.config.strategy, &source, &message)
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => MergeAttempt::Failed {
                message: e.to_string(),
            },
        };

        // One fallback to merge-commit when the chosen strategy failed for a
        // non-conflict reason.
        let needs_fallback = self.config.strategy != MergeStrategy::MergeCommit
            && matches!(attempt, MergeAttempt::Failed { .. });
        if needs_fallback {
            if let MergeAttempt::Failed { message: ref error } = attempt {
                debug!(branch = %branch, error = %error, "Strategy failed; falling back to merge-commit");
            }
            self.git.abort_merge().await;
            attempt = match self
                .git
                .merge_with_strategy(MergeStrategy::MergeCommit, &source, &message)
                .await
            {
                Ok(attempt) => attempt,
                Err(e) => MergeAttempt::Failed {
                    message: e.to_string(),
                },
            };
        }

        match attempt {
            MergeAttempt::Success => self.finish_success(branch).await,
            MergeAttempt::Conflict { files } => self.handle_conflict(branch, files).await,
            MergeAttempt::Failed { message } => {
                self.git.abort_merge().await;
                self.failed_count.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(branch = %branch, error = %message, "Merge failed");
                MergeResult {
                    branch: branch.to_string(),
                    outcome: MergeOutcome::Failed,
                    detail: message,
                    conflicting_files: Vec::new(),
                }
            }
        }
    }

    async fn finish_success(&self, branch: &str) -> MergeResult {
        self.merged.write().insert(branch.to_string());
        self.merged_count.fetch_add(1, AtomicOrdering::Relaxed);

        if let Err(e) = self.git.push(&self.main_branch).await {
            debug!(error = %e, "Mainline push failed (no reachable remote?)");
        }
        self.git.push_delete(branch).await;

        info!(branch = %branch, "Branch merged");
        MergeResult {
            branch: branch.to_string(),
            outcome: MergeOutcome::Merged,
            detail: String::new(),
            conflicting_files: Vec::new(),
        }
    }

    async fn handle_conflict(&self, branch: &str, files: Vec<String>) -> MergeResult {
        self.git.abort_merge().await;
        self.conflict_count.fetch_add(1, AtomicOrdering::Relaxed);

        let retries = {
            let mut counts = self.retry_counts.lock();
            let count = counts.entry(branch.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if retries <= self.config.max_conflict_retries {
            info!(
                branch = %branch,
                retry = retries,
                max = self.config.max_conflict_retries,
                files = ?files,
                "Merge conflict; attempting out-of-line rebase"
            );
            self.rebase_and_requeue(branch).await;
            self.skipped_count.fetch_add(1, AtomicOrdering::Relaxed);
            return MergeResult {
                branch: branch.to_string(),
                outcome: MergeOutcome::Skipped,
                detail: format!("conflict retry {}/{}", retries, self.config.max_conflict_retries),
                conflicting_files: files,
            };
        }

        warn!(branch = %branch, files = ?files, "Conflict retries exhausted");
        let info = ConflictInfo {
            branch: branch.to_string(),
            conflicting_files: files.clone(),
        };
        for callback in self.on_conflict.read().iter() {
            callback(&info);
        }

        MergeResult {
            branch: branch.to_string(),
            outcome: MergeOutcome::Conflict,
            detail: "conflict retries exhausted".to_string(),
            conflicting_files: files,
        }
    }

    /// Rebase the branch onto the latest mainline in a scratch branch and,
    /// when that succeeds, move the branch ref to the rebased tip. The branch
    /// is re-enqueued at high priority either way; a still-conflicting rebase
    /// surfaces again on the next attempt.
    async fn rebase_and_requeue(&self, branch: &str) {
        let temp = format!(
            "{}{}",
            self.config.temp_branch_prefix,
            slugify(branch, 60)
        );

        match self
            .git
            .rebase_out_of_line(branch, &self.main_branch, &temp)
            .await
        {
            Ok(MergeAttempt::Success) => {
                if let Err(e) = self.git.run_checked(&["branch", "-f", branch, &temp]).await {
                    debug!(branch = %branch, error = %e, "Failed to move branch to rebased tip");
                } else if let Err(e) = self.git.push_force_to(branch, branch).await {
                    debug!(branch = %branch, error = %e, "Force push of rebased branch failed");
                }
            }
            Ok(MergeAttempt::Conflict { files }) => {
                debug!(branch = %branch, files = ?files, "Out-of-line rebase conflicted");
            }
            Ok(MergeAttempt::Failed { message }) => {
                debug!(branch = %branch, error = %message, "Out-of-line rebase failed");
            }
            Err(e) => {
                debug!(branch = %branch, error = %e, "Out-of-line rebase errored");
            }
        }

        self.git.run_best_effort(&["checkout", &self.main_branch]).await;
        self.git.run_best_effort(&["branch", "-D", &temp]).await;
        self.enqueue(branch, 1);
    }

    /// Spawn the background drain loop. Each tick fully drains the current
    /// queue before pausing.
    pub fn start_background(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, AtomicOrdering::SeqCst);
        let queue = self;
        tokio::spawn(async move {
            let tick = Duration::from_millis(queue.config.tick_interval_ms);
            while queue.running.load(AtomicOrdering::SeqCst) {
                queue.drain().await;
                tokio::time::sleep(tick).await;
            }
            debug!("Merge queue background loop stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_for_order_tests() -> MergeQueue {
        // Queue-order tests never touch git.
        MergeQueue::new(
            GitRunner::new("/nonexistent"),
            GitMutex::new(),
            MergeConfig::default(),
            "main",
        )
    }

    #[test]
    fn test_enqueue_order_priority_then_time() {
        let queue = queue_for_order_tests();
        assert!(queue.enqueue("worker/low", 9));
        assert!(queue.enqueue("worker/high", 1));
        assert!(queue.enqueue("worker/mid-a", 5));
        assert!(queue.enqueue("worker/mid-b", 5));

        let mut order = Vec::new();
        while let Some(branch) = queue.pop_next() {
            order.push(branch);
        }
        assert_eq!(
            order,
            vec!["worker/high", "worker/mid-a", "worker/mid-b", "worker/low"]
        );
    }

    #[test]
    fn test_duplicate_enqueue_first_admit_wins() {
        let queue = queue_for_order_tests();
        assert!(queue.enqueue("worker/a", 5));
        assert!(!queue.enqueue("worker/a", 1));
        assert_eq!(queue.depth(), 1);

        assert_eq!(queue.pop_next().as_deref(), Some("worker/a"));
        assert_eq!(queue.pop_next(), None);
    }

    #[test]
    fn test_merged_branch_never_readmitted() {
        let queue = queue_for_order_tests();
        queue.merged.write().insert("worker/done".to_string());

        assert!(!queue.enqueue("worker/done", 1));
        assert_eq!(queue.depth(), 0);
        assert!(queue.is_branch_merged("worker/done"));
    }

    #[test]
    fn test_merged_branch_dropped_on_pop() {
        let queue = queue_for_order_tests();
        queue.enqueue("worker/late", 5);
        queue.merged.write().insert("worker/late".to_string());

        assert_eq!(queue.pop_next(), None);
    }

    #[test]
    fn test_reset_retry_count() {
        let queue = queue_for_order_tests();
        queue.retry_counts.lock().insert("worker/x".to_string(), 2);
        assert_eq!(queue.retry_count("worker/x"), 2);

        queue.reset_retry_count("worker/x");
        assert_eq!(queue.retry_count("worker/x"), 0);

        // Resetting an unknown branch is a no-op.
        queue.reset_retry_count("worker/unknown");
    }
}
