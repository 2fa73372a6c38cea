mod fixtures;

use std::sync::Arc;

use tokio::sync::mpsc;

use armada::config::{DispatchConfig, GitConfig, LlmConfig, MergeConfig, PlannerConfig, RunnerConfig};
use armada::dispatch::WorkerDispatcher;
use armada::error::ArmadaError;
use armada::git::{GitMutex, GitRunner};
use armada::llm::LlmClient;
use armada::merge::MergeQueue;
use armada::metrics::MetricsRegistry;
use armada::planner::{Planner, PlannerDeps};
use armada::queue::{Task, TaskQueue, TaskStatus};
use armada::scope::ScopeTracker;

use fixtures::llm::ScriptedLlm;
use fixtures::repo::TestRepo;
use fixtures::runner::{MockSandboxRunner, RunnerScript};

struct Harness {
    planner: Arc<Planner>,
    queue: Arc<TaskQueue>,
    runner: Arc<MockSandboxRunner>,
    llm: Arc<ScriptedLlm>,
}

fn build_planner(
    repo: &TestRepo,
    llm: ScriptedLlm,
    runner: MockSandboxRunner,
    config: PlannerConfig,
    max_task_retries: u32,
) -> Harness {
    let queue = Arc::new(TaskQueue::new(max_task_retries));
    let scope = Arc::new(ScopeTracker::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let llm: Arc<ScriptedLlm> = Arc::new(llm);
    let runner = Arc::new(runner);
    let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();

    let dispatcher = Arc::new(WorkerDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&scope),
        Arc::clone(&runner) as Arc<dyn armada::dispatch::SandboxRunner>,
        DispatchConfig {
            max_workers: 4,
            worker_timeout_secs: 5,
            max_task_retries,
        },
        GitConfig::default(),
        LlmConfig::default(),
        RunnerConfig::default(),
        handoff_tx.clone(),
    ));

    let merge_queue = Arc::new(MergeQueue::new(
        GitRunner::new(repo.path()),
        GitMutex::new(),
        MergeConfig::default(),
        "main",
    ));

    let planner = Arc::new(Planner::new(PlannerDeps {
        queue: Arc::clone(&queue),
        scope,
        dispatcher,
        merge_queue,
        llm: Arc::clone(&llm) as Arc<dyn LlmClient>,
        metrics,
        config,
        branch_prefix: "worker/".to_string(),
        repo_path: repo.path().to_path_buf(),
        handoff_rx,
        handoff_tx,
    }));

    Harness {
        planner,
        queue,
        runner,
        llm,
    }
}

fn fast_config() -> PlannerConfig {
    PlannerConfig {
        min_handoffs_for_replan: 1,
        ..PlannerConfig::default()
    }
}

#[tokio::test]
async fn plans_dispatches_and_reaches_quiescence() {
    let repo = TestRepo::init().await;
    let llm = ScriptedLlm::new().reply(
        "<scratchpad>first batch: one task</scratchpad>\n\
         [{\"description\": \"Implement the a module\", \"scope\": [\"a.ts\"]}]",
    );
    let runner = MockSandboxRunner::new(RunnerScript::Complete {
        files: vec!["a.ts".to_string()],
        tokens: 100,
    });
    let h = build_planner(&repo, llm, runner, fast_config(), 2);

    h.planner.run("build the a module").await.unwrap();

    let task = h.queue.get("task-001").unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.branch, "worker/task-001-implement-the-a-module");

    // First prompt carries full state, the follow-up carries the report.
    let prompts = h.llm.prompts();
    assert!(prompts[0].contains("## Build request"));
    assert!(prompts[0].contains("README.md"));
    assert!(prompts.last().unwrap().contains("Worker reports"));
    assert_eq!(h.runner.invocations(), vec!["task-001".to_string()]);
}

#[tokio::test]
async fn duplicate_task_ids_from_model_are_dropped() {
    let repo = TestRepo::init().await;
    let llm = ScriptedLlm::new().reply(
        "[{\"id\": \"dup\", \"description\": \"first\", \"scope\": [\"a.ts\"]},\
          {\"id\": \"dup\", \"description\": \"second\", \"scope\": [\"b.ts\"]}]",
    );
    let runner = MockSandboxRunner::new(RunnerScript::Complete {
        files: vec!["a.ts".to_string()],
        tokens: 10,
    });
    let h = build_planner(&repo, llm, runner, fast_config(), 2);

    h.planner.run("dedup test").await.unwrap();

    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.queue.get("dup").unwrap().description, "first");
}

#[tokio::test]
async fn inject_task_is_idempotent_per_id() {
    let repo = TestRepo::init().await;
    let h = build_planner(
        &repo,
        ScriptedLlm::new(),
        MockSandboxRunner::new(RunnerScript::Complete {
            files: Vec::new(),
            tokens: 10,
        }),
        fast_config(),
        2,
    );

    let fix = Task::new("fix-001", "Fix compile errors", "worker/").with_priority(1);
    assert!(h.planner.inject_task(fix.clone()));
    assert!(!h.planner.inject_task(fix));
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn failed_handoffs_auto_retry_within_budget() {
    let repo = TestRepo::init().await;
    let llm = ScriptedLlm::new()
        .reply("[{\"description\": \"Flaky work\", \"scope\": [\"f.ts\"]}]");
    let runner = MockSandboxRunner::new(RunnerScript::FailedHandoff {
        summary: "worker crashed".to_string(),
    });
    let h = build_planner(&repo, llm, runner, fast_config(), 1);

    h.planner.run("retry test").await.unwrap();

    let task = h.queue.get("task-001").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 1);
    // Original dispatch plus exactly one auto-retry.
    assert_eq!(h.runner.invocations().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn consecutive_planning_failures_abort_with_backoff() {
    let repo = TestRepo::init().await;
    let llm = ScriptedLlm::new().errors("model endpoint down", 15);
    let runner = MockSandboxRunner::new(RunnerScript::Complete {
        files: Vec::new(),
        tokens: 0,
    });
    let config = PlannerConfig {
        max_consecutive_errors: 10,
        ..fast_config()
    };
    let h = build_planner(&repo, llm, runner, config, 2);

    let result = h.planner.run("doomed run").await;
    match result {
        Err(ArmadaError::Planning(message)) => {
            assert!(message.contains("10 consecutive failures"));
        }
        other => panic!("expected planning abort, got {:?}", other),
    }

    // Exactly max_consecutive_errors calls were attempted; nothing was
    // dispatched by the aborted iterations.
    assert_eq!(h.llm.call_count(), 10);
    assert!(h.queue.is_empty());
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test]
async fn wide_scope_tasks_route_through_subplanner() {
    let repo = TestRepo::init().await;
    // First reply: one wide task. Second (subplanner session): two children.
    // Later planner turns: nothing new.
    let llm = ScriptedLlm::new()
        .reply(
            "[{\"description\": \"Build everything\", \"scope\": \
             [\"a.ts\", \"b.ts\", \"c.ts\"]}]",
        )
        .reply(
            "[{\"description\": \"part one\", \"scope\": [\"a.ts\"]},\
              {\"description\": \"part two\", \"scope\": [\"b.ts\"]}]",
        );
    let runner = MockSandboxRunner::new(RunnerScript::Complete {
        files: vec!["a.ts".to_string()],
        tokens: 50,
    });
    let config = PlannerConfig {
        min_handoffs_for_replan: 1,
        decompose_scope_threshold: 3,
        max_subtasks: 4,
        ..PlannerConfig::default()
    };
    let h = build_planner(&repo, llm, runner, config, 2);

    h.planner.run("big build").await.unwrap();

    // Parent aggregated from its children; children ran in sandboxes.
    let parent = h.queue.get("task-001").unwrap();
    assert_eq!(parent.status, TaskStatus::Complete);
    let child1 = h.queue.get("task-001-s1").unwrap();
    assert_eq!(child1.parent_id.as_deref(), Some("task-001"));
    assert_eq!(child1.status, TaskStatus::Complete);
    assert!(h.queue.get("task-001-s2").is_some());

    let mut invocations = h.runner.invocations();
    invocations.sort();
    assert_eq!(invocations, vec!["task-001-s1", "task-001-s2"]);
}
