use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::parse::{PlannedTask, extract_scratchpad, parse_task_array};
use super::subplanner::Subplanner;
use crate::config::PlannerConfig;
use crate::dispatch::WorkerDispatcher;
use crate::error::{ArmadaError, Result};
use crate::git::GitRunner;
use crate::llm::{LlmClient, LlmSession};
use crate::merge::MergeQueue;
use crate::metrics::MetricsRegistry;
use crate::queue::{Handoff, HandoffStatus, Task, TaskQueue, TaskStatus};
use crate::reconciler::SweepResult;
use crate::scope::ScopeTracker;
use crate::utils::truncate_with_marker;

const BACKOFF_INITIAL_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 30;
const POLL_INTERVAL_MS: u64 = 500;
const RECENT_COMMIT_LIMIT: usize = 10;
const HANDOFF_SUMMARY_TRUNCATE: usize = 400;
const HANDOFF_FILES_SHOWN: usize = 20;
const SWEEP_OUTPUT_TRUNCATE: usize = 1500;

/// Optional planning documents read from the target repo each turn.
const DOC_FILES: &[&str] = &["SPEC.md", "FEATURES.md", "CONVENTIONS.md", "DECISIONS.md"];

const SYSTEM_PROMPT: &str = "You are the planner of an autonomous build system. \
Each turn you receive repository state and worker reports. Maintain a private \
scratchpad between <scratchpad> and </scratchpad> tags; rewrite it completely \
every turn. Then emit a JSON array of new tasks, [] when none are needed. Each \
task is an object with \"description\", \"scope\" (repo-relative file paths), \
\"acceptance\", and optional \"priority\" (lower runs sooner, default 5). Keep \
tasks small and independent, and avoid files listed as locked.";

type TaskObserver = Box<dyn Fn(&Task) + Send + Sync>;
type IterationObserver = Box<dyn Fn(u32, usize) + Send + Sync>;

/// Collaborators handed to the planner by the orchestrator.
pub struct PlannerDeps {
    pub queue: Arc<TaskQueue>,
    pub scope: Arc<ScopeTracker>,
    pub dispatcher: Arc<WorkerDispatcher>,
    pub merge_queue: Arc<MergeQueue>,
    pub llm: Arc<dyn LlmClient>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: PlannerConfig,
    pub branch_prefix: String,
    pub repo_path: PathBuf,
    pub handoff_rx: mpsc::UnboundedReceiver<Handoff>,
    pub handoff_tx: mpsc::UnboundedSender<Handoff>,
}

/// Drives the single long-running model session from repository state and
/// accumulated handoffs to task batches, until quiescence.
pub struct Planner {
    queue: Arc<TaskQueue>,
    scope: Arc<ScopeTracker>,
    dispatcher: Arc<WorkerDispatcher>,
    merge_queue: Arc<MergeQueue>,
    metrics: Arc<MetricsRegistry>,
    config: PlannerConfig,
    branch_prefix: String,
    git: GitRunner,
    repo_path: PathBuf,
    session: LlmSession,
    subplanner: Arc<Subplanner>,

    handoff_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Handoff>>,
    scratchpad: Mutex<String>,
    dispatched_ids: Mutex<HashSet<String>>,
    dispatched_branches: Mutex<Vec<String>>,
    since_last_plan: Mutex<Vec<Handoff>>,
    latest_sweep: Mutex<Option<SweepResult>>,
    last_files: Mutex<HashSet<String>>,
    last_doc_hashes: Mutex<HashMap<&'static str, u64>>,
    task_counter: AtomicU64,
    inflight: Mutex<Vec<JoinHandle<()>>>,
    on_task_created: RwLock<Vec<TaskObserver>>,
    on_iteration: RwLock<Vec<IterationObserver>>,
    running: AtomicBool,
}

impl Planner {
    pub fn new(deps: PlannerDeps) -> Self {
        let subplanner = Arc::new(Subplanner::new(
            Arc::clone(&deps.queue),
            Arc::clone(&deps.dispatcher),
            Arc::clone(&deps.llm),
            deps.config.clone(),
            deps.branch_prefix.clone(),
            deps.handoff_tx.clone(),
        ));
        let session = LlmSession::new(Arc::clone(&deps.llm), Some(SYSTEM_PROMPT.to_string()));

        Self {
            queue: deps.queue,
            scope: deps.scope,
            dispatcher: deps.dispatcher,
            merge_queue: deps.merge_queue,
            metrics: deps.metrics,
            config: deps.config,
            branch_prefix: deps.branch_prefix,
            git: GitRunner::new(&deps.repo_path),
            repo_path: deps.repo_path,
            session,
            subplanner,
            handoff_rx: tokio::sync::Mutex::new(deps.handoff_rx),
            scratchpad: Mutex::new(String::new()),
            dispatched_ids: Mutex::new(HashSet::new()),
            dispatched_branches: Mutex::new(Vec::new()),
            since_last_plan: Mutex::new(Vec::new()),
            latest_sweep: Mutex::new(None),
            last_files: Mutex::new(HashSet::new()),
            last_doc_hashes: Mutex::new(HashMap::new()),
            task_counter: AtomicU64::new(0),
            inflight: Mutex::new(Vec::new()),
            on_task_created: RwLock::new(Vec::new()),
            on_iteration: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn on_task_created(&self, observer: TaskObserver) {
        self.on_task_created.write().push(observer);
    }

    /// Fired after each completed planning iteration with (iteration,
    /// new task count).
    pub fn on_iteration(&self, observer: IterationObserver) {
        self.on_iteration.write().push(observer);
    }

    fn fire_task_created(&self, task: &Task) {
        for observer in self.on_task_created.read().iter() {
            observer(task);
        }
    }

    /// Every branch this run has dispatched, in dispatch order; read by
    /// finalization to find unmerged work.
    pub fn dispatched_branches(&self) -> Vec<String> {
        self.dispatched_branches.lock().clone()
    }

    pub fn set_latest_sweep(&self, sweep: SweepResult) {
        *self.latest_sweep.lock() = Some(sweep);
    }

    /// Current scratchpad text, as last rewritten by the model.
    pub fn scratchpad(&self) -> String {
        self.scratchpad.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Push a task directly into the dispatch pipeline, bypassing the model.
    /// Idempotent for ids that were already dispatched.
    pub fn inject_task(&self, task: Task) -> bool {
        {
            let mut ids = self.dispatched_ids.lock();
            if !ids.insert(task.id.clone()) {
                debug!(task_id = %task.id, "Task already dispatched; injection ignored");
                return false;
            }
        }

        if let Err(e) = self.queue.enqueue(task.clone()) {
            debug!(task_id = %task.id, error = %e, "Injected task enqueue failed");
            return false;
        }

        self.dispatched_branches.lock().push(task.branch.clone());
        info!(task_id = %task.id, branch = %task.branch, "Task injected");
        self.fire_task_created(&task);
        self.spawn_dispatch(task);
        true
    }

    fn spawn_dispatch(&self, task: Task) {
        let handle = if self.subplanner.should_decompose(&task, 0) {
            let subplanner = Arc::clone(&self.subplanner);
            tokio::spawn(async move {
                if let Err(e) = subplanner.run(task, 0).await {
                    warn!(error = %e, "Subplanner run failed");
                }
            })
        } else {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch(task).await {
                    warn!(error = %e, "Dispatch failed");
                }
            })
        };
        self.inflight.lock().push(handle);
    }

    /// Run the planning loop to quiescence: no new tasks, no active work,
    /// nothing pending.
    pub async fn run(&self, request: &str) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mut iteration = 0u32;
        let mut consecutive_errors = 0u32;
        let mut backoff = Duration::from_secs(BACKOFF_INITIAL_SECS);

        while self.running.load(Ordering::SeqCst) {
            if iteration >= self.config.max_iterations {
                warn!(iteration, "Planner hit iteration ceiling");
                break;
            }

            self.drain_handoffs().await;

            let idle = self.no_current_activity();
            let enough_handoffs =
                self.since_last_plan.lock().len() >= self.config.min_handoffs_for_replan;
            let should_plan =
                self.dispatcher.has_capacity() && (iteration == 0 || enough_handoffs || idle);

            if should_plan {
                match self.plan_iteration(request, iteration).await {
                    Ok(new_tasks) => {
                        consecutive_errors = 0;
                        backoff = Duration::from_secs(BACKOFF_INITIAL_SECS);
                        self.metrics.record_planner_iteration();
                        iteration += 1;

                        if new_tasks == 0 && self.no_current_activity() {
                            info!(iteration, "Planning complete; no work remains");
                            break;
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            error = %e,
                            consecutive = consecutive_errors,
                            "Planning iteration failed"
                        );
                        let wait = backoff;
                        backoff = (backoff * 2).min(Duration::from_secs(BACKOFF_CAP_SECS));
                        tokio::time::sleep(wait).await;
                        if consecutive_errors >= self.config.max_consecutive_errors {
                            self.running.store(false, Ordering::SeqCst);
                            return Err(ArmadaError::Planning(format!(
                                "aborted after {} consecutive failures: {}",
                                consecutive_errors, e
                            )));
                        }
                        continue;
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }

        self.await_inflight().await;
        self.drain_handoffs().await;
        self.session.close().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn no_current_activity(&self) -> bool {
        self.queue.pending_count() == 0
            && self.queue.active_count() == 0
            && self.dispatcher.active_count() == 0
    }

    async fn await_inflight(&self) {
        let handles: Vec<JoinHandle<()>> = self.inflight.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Collect completed handoffs; failed ones with retry budget return to
    /// pending and re-dispatch.
    async fn drain_handoffs(&self) {
        let mut rx = self.handoff_rx.lock().await;
        while let Ok(handoff) = rx.try_recv() {
            debug!(task_id = %handoff.task_id, status = %handoff.status, "Handoff collected");

            if handoff.status == HandoffStatus::Failed {
                self.auto_retry(&handoff.task_id);
            }
            self.since_last_plan.lock().push(handoff);
        }
    }

    fn auto_retry(&self, task_id: &str) {
        let Some(task) = self.queue.get(task_id) else {
            return;
        };
        if task.status != TaskStatus::Failed {
            return;
        }
        match self.queue.retry(task_id) {
            Ok(()) => {
                info!(task_id = %task_id, retry = task.retry_count + 1, "Auto-retrying failed task");
                if let Some(task) = self.queue.get(task_id) {
                    self.spawn_dispatch(task);
                }
            }
            Err(ArmadaError::RetryBudgetExhausted { .. }) => {
                debug!(task_id = %task_id, "Retry budget exhausted; task stays failed");
            }
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Auto-retry skipped");
            }
        }
    }

    async fn plan_iteration(&self, request: &str, iteration: u32) -> Result<usize> {
        let state = self.read_repo_state().await?;
        let prompt = if iteration == 0 {
            self.initial_prompt(request, &state)
        } else {
            self.delta_prompt(&state)
        };
        self.remember_state(&state);
        // Reports arriving during the (possibly minutes-long) model call
        // belong to the next bucket.
        self.since_last_plan.lock().clear();

        let completion = self.session.prompt(prompt).await?;
        self.metrics.record_tokens(completion.tokens_used);

        if let Some(pad) = extract_scratchpad(&completion.text) {
            *self.scratchpad.lock() = pad;
        }

        let planned = parse_task_array(&completion.text)?;

        let mut new_tasks = 0;
        for spec in planned {
            if let Some(task) = self.admit(spec) {
                new_tasks += 1;
                self.spawn_dispatch(task);
            }
        }

        info!(iteration, new_tasks, "Planning iteration complete");
        for observer in self.on_iteration.read().iter() {
            observer(iteration, new_tasks);
        }
        Ok(new_tasks)
    }

    /// Turn a model-emitted task into a queued Task, dropping duplicates
    /// against the dispatched-id set.
    fn admit(&self, spec: PlannedTask) -> Option<Task> {
        let id = spec.id.clone().unwrap_or_else(|| {
            format!(
                "task-{:03}",
                self.task_counter.fetch_add(1, Ordering::SeqCst) + 1
            )
        });

        {
            let mut ids = self.dispatched_ids.lock();
            if !ids.insert(id.clone()) {
                debug!(task_id = %id, "Duplicate task from model dropped");
                return None;
            }
        }

        let mut task = Task::new(&id, &spec.description, &self.branch_prefix)
            .with_scope(spec.scope)
            .with_acceptance(spec.acceptance);
        if let Some(priority) = spec.priority {
            task.priority = priority;
        }

        if let Err(e) = self.queue.enqueue(task.clone()) {
            debug!(task_id = %id, error = %e, "Planned task enqueue failed");
            return None;
        }

        self.dispatched_branches.lock().push(task.branch.clone());
        self.fire_task_created(&task);
        Some(task)
    }

    async fn read_repo_state(&self) -> Result<RepoState> {
        let files = self.git.ls_files().await?;
        let commits = self.git.recent_commits(RECENT_COMMIT_LIMIT).await?;

        let mut docs = HashMap::new();
        for name in DOC_FILES {
            if let Ok(content) = tokio::fs::read_to_string(self.repo_path.join(name)).await {
                docs.insert(*name, content);
            }
        }

        Ok(RepoState {
            files,
            commits,
            docs,
        })
    }

    fn remember_state(&self, state: &RepoState) {
        *self.last_files.lock() = state.files.iter().cloned().collect();
        let mut hashes = self.last_doc_hashes.lock();
        hashes.clear();
        for (name, content) in &state.docs {
            hashes.insert(*name, content_hash(content));
        }
    }

    fn initial_prompt(&self, request: &str, state: &RepoState) -> String {
        let mut prompt = format!(
            "## Build request\n{}\n\n## Repository files\n{}\n\n## Recent commits\n{}\n",
            request,
            state.files.join("\n"),
            state.commits,
        );
        for (name, content) in &state.docs {
            prompt.push_str(&format!("\n## {}\n{}\n", name, content));
        }
        prompt.push_str(
            "\nPlan the first batch of tasks. Rewrite your scratchpad, then emit the JSON task array.",
        );
        prompt
    }

    fn delta_prompt(&self, state: &RepoState) -> String {
        let mut prompt = String::from("## Update\n");

        {
            let last = self.last_files.lock();
            let current: HashSet<&String> = state.files.iter().collect();
            let added: Vec<&str> = state
                .files
                .iter()
                .filter(|f| !last.contains(f.as_str()))
                .map(|f| f.as_str())
                .collect();
            let removed: Vec<&str> = last
                .iter()
                .filter(|f| !current.contains(f))
                .map(|f| f.as_str())
                .collect();
            if !added.is_empty() {
                prompt.push_str(&format!("New files: {}\n", added.join(", ")));
            }
            if !removed.is_empty() {
                prompt.push_str(&format!("Removed files: {}\n", removed.join(", ")));
            }
        }

        {
            let hashes = self.last_doc_hashes.lock();
            for (name, content) in &state.docs {
                let changed = hashes
                    .get(name)
                    .map(|h| *h != content_hash(content))
                    .unwrap_or(true);
                if changed {
                    prompt.push_str(&format!("\n## {} (changed)\n{}\n", name, content));
                }
            }
        }

        let handoffs = self.since_last_plan.lock();
        if !handoffs.is_empty() {
            prompt.push_str("\n## Worker reports since last plan\n");
            for handoff in handoffs.iter() {
                let files: Vec<&str> = handoff
                    .files_changed
                    .iter()
                    .take(HANDOFF_FILES_SHOWN)
                    .map(|f| f.as_str())
                    .collect();
                prompt.push_str(&format!(
                    "- {} [{}] {} (files: {})\n",
                    handoff.task_id,
                    handoff.status,
                    truncate_with_marker(&handoff.summary, HANDOFF_SUMMARY_TRUNCATE),
                    files.join(", "),
                ));
            }
        }
        drop(handoffs);

        let active = self.queue.active_task_ids();
        if !active.is_empty() {
            prompt.push_str(&format!("\nActive tasks: {}\n", active.join(", ")));
        }

        let stats = self.merge_queue.stats();
        prompt.push_str(&format!(
            "Merge queue: {} merged, {} conflicts, {} failed, depth {}\n",
            stats.total_merged,
            stats.total_conflicts,
            stats.total_failed,
            self.merge_queue.depth(),
        ));

        let locked = self.scope.locked_files();
        if !locked.is_empty() {
            prompt.push_str(&format!("Locked files (avoid): {}\n", locked.join(", ")));
        }

        if let Some(sweep) = self.latest_sweep.lock().as_ref() {
            prompt.push_str(&format!(
                "\n## Latest sweep\nbuild_ok: {}, tests_ok: {}, conflict_markers: {}\n",
                sweep.build_ok, sweep.tests_ok, sweep.has_conflict_markers,
            ));
            if !sweep.build_ok {
                prompt.push_str(&format!(
                    "Build output:\n{}\n",
                    truncate_with_marker(&sweep.build_output, SWEEP_OUTPUT_TRUNCATE)
                ));
            }
            if !sweep.tests_ok {
                prompt.push_str(&format!(
                    "Test output:\n{}\n",
                    truncate_with_marker(&sweep.test_output, SWEEP_OUTPUT_TRUNCATE)
                ));
            }
        }

        prompt.push_str(
            "\nContinue. Rewrite your scratchpad, then emit the JSON task array ([] if none).",
        );
        prompt
    }
}

struct RepoState {
    files: Vec<String>,
    commits: String,
    docs: HashMap<&'static str, String>,
}

fn content_hash(content: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}
