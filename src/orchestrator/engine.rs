use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::OrchestratorEvents;
use super::finalization::FinalizationPhase;
use crate::config::ArmadaConfig;
use crate::dispatch::{DispatchEvent, ProcessSandboxRunner, SandboxRunner, WorkerDispatcher};
use crate::error::Result;
use crate::git::{GitMutex, GitRunner};
use crate::llm::{HttpLlmClient, LlmClient};
use crate::merge::{ConflictInfo, MergeOutcome, MergeQueue};
use crate::metrics::{GaugeSample, MetricsRegistry, MetricsSnapshot};
use crate::planner::{Planner, PlannerDeps};
use crate::queue::{HandoffStatus, Task, TaskQueue, TaskStatus};
use crate::reconciler::{Reconciler, SweepResult};
use crate::scope::ScopeTracker;
use crate::state::{EventLog, RunEvent};

/// Branch-name marker identifying conflict-fix work; conflicts on such
/// branches never spawn another fix task.
const CONFLICT_FIX_MARKER: &str = "conflict-fix";

/// Top-level assembly: wires the task queue, scope tracker, merge queue,
/// dispatcher, reconciler, and planner, runs the planner loop to quiescence,
/// then executes the finalization phase.
pub struct Orchestrator {
    config: ArmadaConfig,
    queue: Arc<TaskQueue>,
    merge_queue: Arc<MergeQueue>,
    dispatcher: Arc<WorkerDispatcher>,
    reconciler: Arc<Reconciler>,
    planner: Arc<Planner>,
    metrics: Arc<MetricsRegistry>,
    event_log: Arc<EventLog>,
    events: Arc<OrchestratorEvents>,

    conflict_rx: Mutex<Option<mpsc::UnboundedReceiver<ConflictInfo>>>,

    conflict_fix_used: Arc<AtomicUsize>,
    conflict_fix_counter: Arc<AtomicU64>,
    /// Branches preserved for finalization beyond the dispatched set:
    /// timed-out workers and conflicts past the fix budget.
    preserved_branches: Arc<Mutex<HashSet<String>>>,
    finalization_passed: Arc<Mutex<Option<bool>>>,

    services: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    running: AtomicBool,
}

impl Orchestrator {
    /// Build with the default collaborators: the configured sandbox runner
    /// executable and the HTTP LLM client.
    pub fn new(config: ArmadaConfig) -> Result<Self> {
        let runner: Arc<dyn SandboxRunner> = Arc::new(ProcessSandboxRunner::new(
            config.runner.command.clone(),
            config.runner.args.clone(),
        ));
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm.clone())?);
        Self::with_collaborators(config, runner, llm)
    }

    /// Build with explicit collaborators; the seam tests and embedders use.
    pub fn with_collaborators(
        config: ArmadaConfig,
        runner: Arc<dyn SandboxRunner>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(TaskQueue::new(config.dispatch.max_task_retries));
        let scope = Arc::new(ScopeTracker::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let events = Arc::new(OrchestratorEvents::new());
        let event_log = Arc::new(EventLog::new(&config.log_path)?);
        let git_mutex = GitMutex::new();

        let merge_queue = Arc::new(MergeQueue::new(
            GitRunner::new(&config.target_repo_path),
            git_mutex,
            config.merge.clone(),
            config.git.main_branch.clone(),
        ));

        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(WorkerDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&scope),
            runner,
            config.dispatch.clone(),
            config.git.clone(),
            config.llm.clone(),
            config.runner.clone(),
            handoff_tx.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            config.reconciler.clone(),
            &config.target_repo_path,
            Arc::clone(&llm),
            Arc::clone(&merge_queue),
            config.git.branch_prefix.clone(),
        ));

        let planner = Arc::new(Planner::new(PlannerDeps {
            queue: Arc::clone(&queue),
            scope,
            dispatcher: Arc::clone(&dispatcher),
            merge_queue: Arc::clone(&merge_queue),
            llm,
            metrics: Arc::clone(&metrics),
            config: config.planner.clone(),
            branch_prefix: config.git.branch_prefix.clone(),
            repo_path: config.target_repo_path.clone(),
            handoff_rx,
            handoff_tx,
        }));

        let orchestrator = Self {
            config,
            queue,
            merge_queue,
            dispatcher,
            reconciler,
            planner,
            metrics,
            event_log,
            events,
            conflict_rx: Mutex::new(None),
            conflict_fix_used: Arc::new(AtomicUsize::new(0)),
            conflict_fix_counter: Arc::new(AtomicU64::new(0)),
            preserved_branches: Arc::new(Mutex::new(HashSet::new())),
            finalization_passed: Arc::new(Mutex::new(None)),
            services: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
        };
        orchestrator.wire_events();
        Ok(orchestrator)
    }

    pub fn events(&self) -> &OrchestratorEvents {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    pub fn merge_queue(&self) -> &Arc<MergeQueue> {
        &self.merge_queue
    }

    /// Subscribe the in-process listeners: queue transitions, dispatcher
    /// events, merge results, and conflicts. Channel consumers start in
    /// `start()`.
    fn wire_events(&self) {
        // Task status changes -> event log + external callbacks.
        {
            let event_log = Arc::clone(&self.event_log);
            let events = Arc::clone(&self.events);
            self.queue.on_status_change(Box::new(move |task_id, status| {
                event_log.emit(RunEvent::TaskStatusChanged {
                    timestamp: Utc::now(),
                    task_id: task_id.to_string(),
                    status,
                });
                events.fire_task_status_change(task_id, status);
            }));
        }

        // Planner task creation + iteration milestones.
        {
            let event_log = Arc::clone(&self.event_log);
            let events = Arc::clone(&self.events);
            self.planner.on_task_created(Box::new(move |task| {
                event_log.emit(RunEvent::TaskCreated {
                    timestamp: Utc::now(),
                    task_id: task.id.clone(),
                    branch: task.branch.clone(),
                    priority: task.priority,
                    scope: task.scope.clone(),
                });
                events.fire_task_created(task);
            }));

            let event_log = Arc::clone(&self.event_log);
            let events = Arc::clone(&self.events);
            let queue = Arc::clone(&self.queue);
            self.planner.on_iteration(Box::new(move |iteration, new_tasks| {
                event_log.emit(RunEvent::PlannerIteration {
                    timestamp: Utc::now(),
                    iteration,
                    new_tasks,
                    active_tasks: queue.active_count(),
                });
                events.fire_iteration_complete(iteration, new_tasks);
            }));
        }

        // Dispatcher events: completion feeds the merge queue.
        {
            let event_log = Arc::clone(&self.event_log);
            let events = Arc::clone(&self.events);
            let metrics = Arc::clone(&self.metrics);
            let queue = Arc::clone(&self.queue);
            let merge_queue = Arc::clone(&self.merge_queue);
            let timeout_secs = self.config.dispatch.worker_timeout_secs;
            self.dispatcher.subscribe(Box::new(move |event| match event {
                DispatchEvent::TaskComplete(handoff) => {
                    metrics.record_tokens(handoff.metrics.tokens_used);
                    event_log.emit(RunEvent::HandoffReceived {
                        timestamp: Utc::now(),
                        task_id: handoff.task_id.clone(),
                        status: handoff.status,
                        files_changed: handoff.files_changed.len(),
                        tokens_used: handoff.metrics.tokens_used,
                    });
                    events.fire_task_completed(handoff);

                    if matches!(
                        handoff.status,
                        HandoffStatus::Complete | HandoffStatus::Partial
                    ) {
                        if let Some(task) = queue.get(&handoff.task_id) {
                            merge_queue.enqueue(&task.branch, task.priority);
                        }
                    }
                }
                DispatchEvent::WorkerTimeout { task_id, branch } => {
                    metrics.record_worker_timeout();
                    event_log.emit(RunEvent::WorkerTimeout {
                        timestamp: Utc::now(),
                        task_id: task_id.clone(),
                        branch: branch.clone(),
                        timeout_secs,
                    });
                    events.fire_worker_timeout(task_id);
                }
                DispatchEvent::WorkerFailed { task_id, message } => {
                    event_log.emit(RunEvent::error(
                        "dispatcher",
                        format!("{}: {}", task_id, message),
                    ));
                    events.fire_error("dispatcher", message);
                }
                DispatchEvent::EmptyDiff { task_id } => {
                    metrics.record_empty_diff();
                    events.fire_empty_diff(task_id);
                }
                DispatchEvent::SuspiciousTask { task_id } => {
                    metrics.record_suspicious();
                    events.fire_suspicious_task(task_id);
                }
            }));
        }

        // Merge results -> metrics mirror + event log. A skipped merge is a
        // conflict that earned a retry, so it counts toward conflicts too.
        {
            let event_log = Arc::clone(&self.event_log);
            let metrics = Arc::clone(&self.metrics);
            self.merge_queue.on_merge_result(Box::new(move |result| {
                match result.outcome {
                    MergeOutcome::Merged => metrics.record_merge(),
                    MergeOutcome::Skipped => {
                        metrics.record_merge_skipped();
                        metrics.record_conflict();
                    }
                    MergeOutcome::Conflict => metrics.record_conflict(),
                    MergeOutcome::Failed => metrics.record_merge_failed(),
                }
                event_log.emit(RunEvent::MergeResult {
                    timestamp: Utc::now(),
                    branch: result.branch.clone(),
                    outcome: result.outcome.to_string(),
                    detail: result.detail.clone(),
                });
            }));
        }

        // Conflict callback -> channel; consumed by the conflict service so
        // injection happens outside the merge loop.
        {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.conflict_rx.lock() = Some(rx);
            self.merge_queue.on_conflict(Box::new(move |info| {
                let _ = tx.send(info.clone());
            }));
        }
    }

    /// Start background services. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let mut services = self.services.lock();

        services.push(Arc::clone(&self.merge_queue).start_background());

        let (sweep_tx, sweep_rx) = mpsc::unbounded_channel();
        services.push(Arc::clone(&self.reconciler).start_background(sweep_tx));
        services.push(self.spawn_sweep_consumer(sweep_rx));

        if let Some(conflict_rx) = self.conflict_rx.lock().take() {
            services.push(self.spawn_conflict_consumer(conflict_rx));
        }

        services.push(self.spawn_monitor());
        info!("Background services started");
    }

    fn spawn_sweep_consumer(
        &self,
        mut rx: mpsc::UnboundedReceiver<SweepResult>,
    ) -> JoinHandle<()> {
        let planner = Arc::clone(&self.planner);
        let dispatcher = Arc::clone(&self.dispatcher);
        let metrics = Arc::clone(&self.metrics);
        let events = Arc::clone(&self.events);
        let event_log = Arc::clone(&self.event_log);
        let preserved = Arc::clone(&self.preserved_branches);

        tokio::spawn(async move {
            while let Some(sweep) = rx.recv().await {
                event_log.emit(RunEvent::SweepCompleted {
                    timestamp: Utc::now(),
                    build_ok: sweep.build_ok,
                    tests_ok: sweep.tests_ok,
                    has_conflict_markers: sweep.has_conflict_markers,
                    fix_tasks: sweep.fix_tasks.len(),
                });
                events.fire_sweep_complete(&sweep);

                // Timed-out branches surface after each sweep and are kept
                // for finalization's merge retry.
                for branch in dispatcher.drain_timed_out() {
                    preserved.lock().insert(branch);
                }

                planner.set_latest_sweep(sweep.clone());
                for task in sweep.fix_tasks {
                    metrics.record_fix_task();
                    planner.inject_task(task);
                }
            }
        })
    }

    fn spawn_conflict_consumer(
        &self,
        mut rx: mpsc::UnboundedReceiver<ConflictInfo>,
    ) -> JoinHandle<()> {
        let planner = Arc::clone(&self.planner);
        let metrics = Arc::clone(&self.metrics);
        let events = Arc::clone(&self.events);
        let preserved = Arc::clone(&self.preserved_branches);
        let branch_prefix = self.config.git.branch_prefix.clone();
        let budget = self.config.orchestrator.max_conflict_fix_tasks;
        let used = Arc::clone(&self.conflict_fix_used);
        let counter = Arc::clone(&self.conflict_fix_counter);

        tokio::spawn(async move {
            while let Some(info) = rx.recv().await {
                if info.branch.contains(CONFLICT_FIX_MARKER) {
                    debug!(branch = %info.branch, "Conflict on a conflict-fix branch; ignoring");
                    continue;
                }

                let already_used = used.fetch_add(1, Ordering::SeqCst);
                if already_used >= budget {
                    warn!(
                        branch = %info.branch,
                        budget,
                        "Conflict-fix budget exhausted; preserving branch for finalization"
                    );
                    preserved.lock().insert(info.branch.clone());
                    continue;
                }

                let id = format!(
                    "conflict-fix-{:03}",
                    counter.fetch_add(1, Ordering::SeqCst) + 1
                );
                let task = Task::new(
                    &id,
                    format!("Resolve merge conflicts from {}", info.branch),
                    &branch_prefix,
                )
                .with_scope(info.conflicting_files.clone())
                .with_priority(1)
                .with_conflict_source(&info.branch);

                info!(task_id = %id, source = %info.branch, "Injecting conflict-fix task");
                metrics.record_conflict_fix_task();
                events.fire_error(
                    "merge-queue",
                    &format!("conflict retries exhausted on {}", info.branch),
                );
                planner.inject_task(task);
            }
        })
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.monitor.health_check_interval_secs.max(1));
        let event_log = Arc::clone(&self.event_log);
        let events = Arc::clone(&self.events);
        let metrics = Arc::clone(&self.metrics);
        let queue = Arc::clone(&self.queue);
        let dispatcher = Arc::clone(&self.dispatcher);
        let merge_queue = Arc::clone(&self.merge_queue);
        let finalization_passed = Arc::clone(&self.finalization_passed);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = sample_snapshot(
                    &metrics,
                    &queue,
                    &dispatcher,
                    &merge_queue,
                    &finalization_passed,
                );
                event_log.emit(RunEvent::Metrics {
                    timestamp: Utc::now(),
                    snapshot: snapshot.clone(),
                });
                events.fire_metrics_update(&snapshot);
            }
        })
    }

    /// Execute a full run: services, planner loop, finalization, snapshot.
    /// Always returns a metrics snapshot, even for truncated sessions.
    pub async fn run(&self, request: &str) -> MetricsSnapshot {
        self.event_log.emit(RunEvent::RunStarted {
            timestamp: Utc::now(),
            request: request.to_string(),
        });
        self.start();

        match self.planner.run(request).await {
            Ok(()) => {
                if self.config.finalization.enabled {
                    let outcome = FinalizationPhase::new(self).run().await;
                    *self.finalization_passed.lock() = Some(outcome.passed);
                    self.events.fire_finalization_complete(outcome.passed);
                    self.event_log.emit(RunEvent::FinalizationCompleted {
                        timestamp: Utc::now(),
                        passed: outcome.passed,
                        attempts: outcome.attempts,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "Planner aborted; skipping finalization");
                self.event_log.emit(RunEvent::error("planner", e.to_string()));
                self.events.fire_error("planner", &e.to_string());
            }
        }

        self.stop().await;
        let snapshot = self.snapshot();
        self.event_log.emit(RunEvent::RunCompleted {
            timestamp: Utc::now(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Stop services and flag the planner down. Idempotent; safe mid-loop
    /// or idle.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.planner.stop();
        self.reconciler.stop();
        self.merge_queue.stop();

        let services: Vec<JoinHandle<()>> = self.services.lock().drain(..).collect();
        for service in services {
            service.abort();
        }
        self.started.store(false, Ordering::SeqCst);
        info!("Orchestrator stopped");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        sample_snapshot(
            &self.metrics,
            &self.queue,
            &self.dispatcher,
            &self.merge_queue,
            &self.finalization_passed,
        )
    }

    // --- internals shared with finalization -------------------------------

    pub(super) fn config(&self) -> &ArmadaConfig {
        &self.config
    }

    pub(super) fn queue_handle(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub(super) fn dispatcher_handle(&self) -> &Arc<WorkerDispatcher> {
        &self.dispatcher
    }

    pub(super) fn reconciler_handle(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub(super) fn events_handle(&self) -> &Arc<OrchestratorEvents> {
        &self.events
    }

    pub(super) fn event_log_handle(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    /// Branches this run produced that the merge queue has not integrated:
    /// dispatched branches plus preserved (timed-out / over-budget) ones.
    pub(super) fn unmerged_branches(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut branches = Vec::new();
        let preserved = self.preserved_branches.lock();
        for branch in self
            .planner
            .dispatched_branches()
            .into_iter()
            .chain(preserved.iter().cloned())
        {
            if !self.merge_queue.is_branch_merged(&branch) && seen.insert(branch.clone()) {
                branches.push(branch);
            }
        }
        branches
    }

    pub(super) fn drain_timed_out_into_preserved(&self) {
        for branch in self.dispatcher.drain_timed_out() {
            self.preserved_branches.lock().insert(branch);
        }
    }
}

fn sample_snapshot(
    metrics: &MetricsRegistry,
    queue: &TaskQueue,
    dispatcher: &WorkerDispatcher,
    merge_queue: &MergeQueue,
    finalization_passed: &Mutex<Option<bool>>,
) -> MetricsSnapshot {
    let mut snapshot = metrics.snapshot(GaugeSample {
        completed_tasks: queue.count_with_status(TaskStatus::Complete) as u64,
        failed_tasks: queue.count_with_status(TaskStatus::Failed) as u64,
        blocked_tasks: queue.count_with_status(TaskStatus::Blocked) as u64,
        pending_tasks: queue.pending_count() as u64,
        active_workers: dispatcher.active_count() as u64,
        merge_queue_depth: merge_queue.depth() as u64,
    });
    snapshot.finalization_passed = *finalization_passed.lock();
    snapshot
}
