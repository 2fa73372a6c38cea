mod fixtures;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use armada::config::{DispatchConfig, GitConfig, LlmConfig, RunnerConfig};
use armada::dispatch::{DispatchEvent, WorkerDispatcher};
use armada::queue::{Handoff, HandoffStatus, Task, TaskQueue, TaskStatus};
use armada::scope::ScopeTracker;

use fixtures::runner::{MockSandboxRunner, RunnerScript};

struct Harness {
    dispatcher: Arc<WorkerDispatcher>,
    queue: Arc<TaskQueue>,
    scope: Arc<ScopeTracker>,
    handoff_rx: mpsc::UnboundedReceiver<Handoff>,
}

fn harness(runner: Arc<MockSandboxRunner>, max_workers: usize) -> Harness {
    let queue = Arc::new(TaskQueue::new(2));
    let scope = Arc::new(ScopeTracker::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(WorkerDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&scope),
        runner,
        DispatchConfig {
            max_workers,
            worker_timeout_secs: 5,
            max_task_retries: 2,
        },
        GitConfig::default(),
        LlmConfig::default(),
        RunnerConfig::default(),
        tx,
    ));
    Harness {
        dispatcher,
        queue,
        scope,
        handoff_rx: rx,
    }
}

fn task(id: &str, scope: &[&str]) -> Task {
    Task::new(id, format!("implement {}", id), "worker/")
        .with_scope(scope.iter().map(|s| s.to_string()).collect())
}

#[tokio::test]
async fn single_worker_dispatch_is_serial() {
    let runner = Arc::new(
        MockSandboxRunner::new(RunnerScript::Complete {
            files: vec!["a.ts".to_string()],
            tokens: 100,
        })
        .with_delay(Duration::from_millis(50)),
    );
    let h = harness(Arc::clone(&runner), 1);

    h.queue.enqueue(task("t1", &["a.ts"])).unwrap();
    h.queue.enqueue(task("t2", &["b.ts"])).unwrap();

    let d1 = Arc::clone(&h.dispatcher);
    let d2 = Arc::clone(&h.dispatcher);
    let t1 = task("t1", &["a.ts"]);
    let t2 = task("t2", &["b.ts"]);
    let (r1, r2) = tokio::join!(d1.dispatch(t1), d2.dispatch(t2));
    r1.unwrap();
    r2.unwrap();

    assert_eq!(runner.max_concurrency(), 1);
    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Complete);
    assert_eq!(h.queue.get("t2").unwrap().status, TaskStatus::Complete);
}

#[tokio::test]
async fn concurrency_capped_at_max_workers() {
    let runner = Arc::new(
        MockSandboxRunner::new(RunnerScript::Complete {
            files: vec!["x.ts".to_string()],
            tokens: 10,
        })
        .with_delay(Duration::from_millis(30)),
    );
    let h = harness(Arc::clone(&runner), 2);

    let mut handles = Vec::new();
    for i in 0..5 {
        let id = format!("t{}", i);
        h.queue.enqueue(task(&id, &[])).unwrap();
        let dispatcher = Arc::clone(&h.dispatcher);
        let t = task(&id, &[]);
        handles.push(tokio::spawn(async move { dispatcher.dispatch(t).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(runner.max_concurrency() <= 2);
    assert_eq!(h.queue.count_with_status(TaskStatus::Complete), 5);
}

#[tokio::test]
async fn empty_diff_and_suspicious_observers_fire_once() {
    let runner = Arc::new(MockSandboxRunner::new(RunnerScript::Complete {
        files: Vec::new(),
        tokens: 0,
    }));
    let h = harness(runner, 4);

    let empty_count = Arc::new(AtomicUsize::new(0));
    let suspicious_count = Arc::new(AtomicUsize::new(0));
    let empty = Arc::clone(&empty_count);
    let suspicious = Arc::clone(&suspicious_count);
    h.dispatcher.subscribe(Box::new(move |event| match event {
        DispatchEvent::EmptyDiff { .. } => {
            empty.fetch_add(1, Ordering::SeqCst);
        }
        DispatchEvent::SuspiciousTask { .. } => {
            suspicious.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }));

    h.queue.enqueue(task("t1", &[])).unwrap();
    h.dispatcher.dispatch(task("t1", &[])).await.unwrap();

    assert_eq!(empty_count.load(Ordering::SeqCst), 1);
    assert_eq!(suspicious_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_records_branch_and_fails_task() {
    let runner = Arc::new(MockSandboxRunner::new(RunnerScript::Timeout));
    let mut h = harness(runner, 4);

    let timeout_events = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&timeout_events);
    h.dispatcher.subscribe(Box::new(move |event| {
        if matches!(event, DispatchEvent::WorkerTimeout { .. }) {
            sink.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let t = task("slow", &["s.ts"]);
    let branch = t.branch.clone();
    h.queue.enqueue(t.clone()).unwrap();
    h.dispatcher.dispatch(t).await.unwrap();

    assert_eq!(h.queue.get("slow").unwrap().status, TaskStatus::Failed);
    assert_eq!(h.dispatcher.drain_timed_out(), vec![branch]);
    // Draining empties the set.
    assert!(h.dispatcher.drain_timed_out().is_empty());
    assert_eq!(timeout_events.load(Ordering::SeqCst), 1);

    // A synthetic failure handoff reaches the planner channel.
    let handoff = h.handoff_rx.recv().await.unwrap();
    assert_eq!(handoff.task_id, "slow");
    assert_eq!(handoff.status, HandoffStatus::Failed);
    assert!(handoff.summary.contains("timed out"));
}

#[tokio::test]
async fn dispatch_error_fails_task_and_notifies() {
    let runner = Arc::new(MockSandboxRunner::new(RunnerScript::DispatchError {
        message: "sandbox refused to start".to_string(),
    }));
    let mut h = harness(runner, 4);

    h.queue.enqueue(task("t1", &[])).unwrap();
    h.dispatcher.dispatch(task("t1", &[])).await.unwrap();

    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Failed);
    let handoff = h.handoff_rx.recv().await.unwrap();
    assert_eq!(handoff.status, HandoffStatus::Failed);
    assert!(handoff.summary.contains("sandbox refused to start"));
}

#[tokio::test]
async fn blocked_handoff_blocks_task() {
    let runner = Arc::new(MockSandboxRunner::new(RunnerScript::BlockedHandoff {
        summary: "needs human decision".to_string(),
    }));
    let h = harness(runner, 4);

    h.queue.enqueue(task("t1", &[])).unwrap();
    h.dispatcher.dispatch(task("t1", &[])).await.unwrap();
    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Blocked);
}

#[tokio::test]
async fn scope_released_after_settle() {
    let runner = Arc::new(MockSandboxRunner::new(RunnerScript::Complete {
        files: vec!["a.ts".to_string()],
        tokens: 10,
    }));
    let h = harness(runner, 4);

    h.queue.enqueue(task("t1", &["a.ts", "b.ts"])).unwrap();
    h.dispatcher.dispatch(task("t1", &["a.ts", "b.ts"])).await.unwrap();

    assert!(h.scope.locked_files().is_empty());
    assert_eq!(h.scope.active_claim_count(), 0);
}

#[tokio::test]
async fn tasks_beyond_pending_are_skipped() {
    let runner = Arc::new(MockSandboxRunner::new(RunnerScript::Complete {
        files: Vec::new(),
        tokens: 10,
    }));
    let h = harness(Arc::clone(&runner), 4);

    let t = task("t1", &[]);
    h.queue.enqueue(t.clone()).unwrap();
    h.queue.assign("t1", "w").unwrap();
    h.queue.start("t1").unwrap();
    h.queue.complete("t1").unwrap();

    let result = h.dispatcher.dispatch(t).await.unwrap();
    assert!(result.is_none());
    assert!(runner.invocations().is_empty());
}
