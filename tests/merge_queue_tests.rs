mod fixtures;

use std::sync::Arc;

use parking_lot::Mutex;

use armada::config::{MergeConfig, MergeStrategy};
use armada::git::{GitMutex, GitRunner};
use armada::merge::{ConflictInfo, MergeOutcome, MergeQueue};

use fixtures::repo::TestRepo;

fn merge_queue(repo: &TestRepo, config: MergeConfig) -> MergeQueue {
    MergeQueue::new(GitRunner::new(repo.path()), GitMutex::new(), config, "main")
}

#[tokio::test]
async fn clean_branch_merges_and_is_marked() {
    let repo = TestRepo::init().await;
    repo.branch_with_commit("worker/t1-add-a", "a.ts", "export const a = 1;\n")
        .await;

    let queue = merge_queue(&repo, MergeConfig::default());
    assert!(queue.enqueue("worker/t1-add-a", 5));

    let results = queue.drain().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, MergeOutcome::Merged);
    assert!(queue.is_branch_merged("worker/t1-add-a"));
    assert_eq!(queue.stats().total_merged, 1);

    // The commit landed on main.
    assert!(repo.path().join("a.ts").exists());
    assert_eq!(repo.git.current_branch().await.unwrap(), "main");
}

#[tokio::test]
async fn fast_forward_strategy_falls_back_to_merge_commit() {
    let repo = TestRepo::init().await;
    repo.branch_with_commit("worker/t1-feature", "feature.ts", "ok\n")
        .await;
    // Advance main so the branch cannot fast-forward; files differ, so no
    // conflict either.
    repo.commit_file("mainline.ts", "main moved\n", "mainline work")
        .await;

    let config = MergeConfig {
        strategy: MergeStrategy::FastForward,
        ..MergeConfig::default()
    };
    let queue = merge_queue(&repo, config);
    queue.enqueue("worker/t1-feature", 5);

    let results = queue.drain().await;
    assert_eq!(results[0].outcome, MergeOutcome::Merged);
    assert!(repo.path().join("feature.ts").exists());
    assert!(repo.path().join("mainline.ts").exists());
}

#[tokio::test]
async fn merged_branch_is_never_readmitted() {
    let repo = TestRepo::init().await;
    repo.branch_with_commit("worker/t1-x", "x.ts", "x\n").await;

    let queue = merge_queue(&repo, MergeConfig::default());
    queue.enqueue("worker/t1-x", 5);
    queue.drain().await;
    assert!(queue.is_branch_merged("worker/t1-x"));

    assert!(!queue.enqueue("worker/t1-x", 1));
    assert_eq!(queue.depth(), 0);
    assert!(queue.drain().await.is_empty());
}

#[tokio::test]
async fn conflict_increments_retry_and_requeues_at_high_priority() {
    let repo = TestRepo::init().await;
    // Both sides change README.md.
    repo.branch_with_commit("worker/t1-readme", "README.md", "branch version\n")
        .await;
    repo.commit_file("README.md", "main version\n", "mainline edit")
        .await;

    let config = MergeConfig {
        max_conflict_retries: 5,
        ..MergeConfig::default()
    };
    let queue = merge_queue(&repo, config);
    queue.enqueue("worker/t1-readme", 5);

    // The drain keeps retrying the re-enqueued branch until the cap; every
    // under-cap conflict surfaces as Skipped with the conflicting file named.
    let results = queue.drain().await;
    let skipped: Vec<_> = results
        .iter()
        .filter(|r| r.outcome == MergeOutcome::Skipped)
        .collect();
    assert!(!skipped.is_empty());
    assert_eq!(skipped[0].conflicting_files, vec!["README.md".to_string()]);
    assert!(queue.retry_count("worker/t1-readme") >= 1);
    assert!(!queue.is_branch_merged("worker/t1-readme"));
}

#[tokio::test]
async fn conflict_exhaustion_fires_callback_with_files() {
    let repo = TestRepo::init().await;
    repo.branch_with_commit("worker/t2-readme", "README.md", "branch edit\n")
        .await;
    repo.commit_file("README.md", "diverged main\n", "mainline edit")
        .await;

    let config = MergeConfig {
        max_conflict_retries: 2,
        ..MergeConfig::default()
    };
    let queue = merge_queue(&repo, config);

    let conflicts: Arc<Mutex<Vec<ConflictInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&conflicts);
    queue.on_conflict(Box::new(move |info| {
        sink.lock().push(info.clone());
    }));

    queue.enqueue("worker/t2-readme", 5);
    let results = queue.drain().await;

    // Two retried attempts, then the exhausted attempt.
    let outcomes: Vec<_> = results.iter().map(|r| r.outcome.clone()).collect();
    assert_eq!(
        outcomes,
        vec![
            MergeOutcome::Skipped,
            MergeOutcome::Skipped,
            MergeOutcome::Conflict
        ]
    );

    let fired = conflicts.lock();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].branch, "worker/t2-readme");
    assert_eq!(fired[0].conflicting_files, vec!["README.md".to_string()]);

    let stats = queue.stats();
    assert_eq!(stats.total_conflicts, 3);
    assert_eq!(stats.total_skipped, 2);
    assert_eq!(stats.total_merged, 0);

    // Retry cap invariant held throughout: the counter never passed
    // max_conflict_retries + 1 (the exhausted attempt).
    assert_eq!(queue.retry_count("worker/t2-readme"), 3);
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn conflicting_branch_merges_after_external_rewrite() {
    let repo = TestRepo::init().await;
    repo.branch_with_commit("worker/t3-clean", "clean.ts", "fine\n")
        .await;
    repo.branch_with_commit("worker/t3-readme", "README.md", "branch edit\n")
        .await;
    repo.commit_file("README.md", "diverged main\n", "mainline edit")
        .await;

    let config = MergeConfig {
        max_conflict_retries: 1,
        ..MergeConfig::default()
    };
    let queue = merge_queue(&repo, config);
    queue.enqueue("worker/t3-clean", 5);
    queue.enqueue("worker/t3-readme", 5);
    queue.drain().await;

    assert!(queue.is_branch_merged("worker/t3-clean"));
    assert!(!queue.is_branch_merged("worker/t3-readme"));
    assert!(queue.stats().total_conflicts >= 1);

    // A conflict-fix worker rewrites the branch on top of latest main.
    repo.rewrite_branch("worker/t3-readme", "resolved.ts", "resolved\n")
        .await;
    queue.reset_retry_count("worker/t3-readme");
    queue.enqueue("worker/t3-readme", 1);
    let results = queue.drain().await;

    assert_eq!(results.last().unwrap().outcome, MergeOutcome::Merged);
    assert!(queue.is_branch_merged("worker/t3-readme"));
    assert_eq!(queue.stats().total_merged, 2);
}

#[tokio::test]
async fn nonexistent_branch_reports_failed_not_conflict() {
    let repo = TestRepo::init().await;
    let queue = merge_queue(&repo, MergeConfig::default());
    queue.enqueue("worker/ghost", 5);

    let results = queue.drain().await;
    assert_eq!(results[0].outcome, MergeOutcome::Failed);
    assert!(results[0].conflicting_files.is_empty());
    assert_eq!(queue.stats().total_failed, 1);
}
