use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use super::payload::WorkerPayload;
use super::sandbox::{SandboxRunner, WorkerLine};
use crate::config::{DispatchConfig, GitConfig, LlmConfig, RunnerConfig};
use crate::error::{ArmadaError, Result};
use crate::queue::{Handoff, HandoffStatus, Task, TaskQueue, TaskStatus};
use crate::scope::ScopeTracker;

/// Observable dispatcher events; the orchestrator fans these out to its
/// external callback lists.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    TaskComplete(Handoff),
    WorkerFailed { task_id: String, message: String },
    WorkerTimeout { task_id: String, branch: String },
    EmptyDiff { task_id: String },
    SuspiciousTask { task_id: String },
}

type EventObserver = Box<dyn Fn(&DispatchEvent) + Send + Sync>;

/// Bounded-concurrency gate in front of the sandbox runner. Holds the
/// dispatch semaphore, scope registration, stdout classification, the hard
/// wall-clock timeout, and handoff validation.
pub struct WorkerDispatcher {
    queue: Arc<TaskQueue>,
    scope: Arc<ScopeTracker>,
    runner: Arc<dyn SandboxRunner>,
    semaphore: Arc<Semaphore>,
    config: DispatchConfig,
    git_config: GitConfig,
    llm_config: LlmConfig,
    runner_config: RunnerConfig,

    handoff_tx: mpsc::UnboundedSender<Handoff>,
    active: AtomicUsize,
    tool_calls: Arc<Mutex<HashMap<String, u64>>>,
    timed_out_branches: Mutex<HashSet<String>>,
    observers: RwLock<Vec<EventObserver>>,
}

impl WorkerDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        scope: Arc<ScopeTracker>,
        runner: Arc<dyn SandboxRunner>,
        config: DispatchConfig,
        git_config: GitConfig,
        llm_config: LlmConfig,
        runner_config: RunnerConfig,
        handoff_tx: mpsc::UnboundedSender<Handoff>,
    ) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            queue,
            scope,
            runner,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            config,
            git_config,
            llm_config,
            runner_config,
            handoff_tx,
            active: AtomicUsize::new(0),
            tool_calls: Arc::new(Mutex::new(HashMap::new())),
            timed_out_branches: Mutex::new(HashSet::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: EventObserver) {
        self.observers.write().push(observer);
    }

    fn notify(&self, event: &DispatchEvent) {
        for observer in self.observers.read().iter() {
            observer(event);
        }
    }

    /// Workers currently holding a semaphore permit and executing.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// True when a dispatch could start without waiting.
    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Sum of live tool-call counts across in-flight tasks.
    pub fn total_tool_calls(&self) -> u64 {
        self.tool_calls.lock().values().sum()
    }

    /// Branches whose workers hit the wall clock; drained by finalization
    /// for a merge retry.
    pub fn drain_timed_out(&self) -> Vec<String> {
        let mut set = self.timed_out_branches.lock();
        let mut branches: Vec<String> = set.drain().collect();
        branches.sort();
        branches
    }

    /// Execute one task through the semaphore, forwarding the settled
    /// handoff to the planner channel. Suspends until capacity frees.
    pub async fn dispatch(&self, task: Task) -> Result<Option<Handoff>> {
        self.dispatch_inner(task, true).await
    }

    /// Like `dispatch`, but the handoff is only returned, not forwarded.
    /// Used by the subplanner, which aggregates child handoffs itself.
    pub async fn dispatch_quiet(&self, task: Task) -> Result<Option<Handoff>> {
        self.dispatch_inner(task, false).await
    }

    /// Every exit path releases the permit and the scope claims. Returns
    /// `None` when the task was skipped because it had already moved on.
    async fn dispatch_inner(&self, task: Task, forward: bool) -> Result<Option<Handoff>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ArmadaError::Dispatch {
                task_id: task.id.clone(),
                message: "dispatcher is shut down".to_string(),
            })?;

        // The task may have moved on (or been retried elsewhere) while this
        // dispatch waited for capacity.
        let current = match self.queue.get(&task.id) {
            Some(current) => current,
            None => {
                debug!(task_id = %task.id, "Task vanished before dispatch; skipping");
                return Ok(None);
            }
        };
        match current.status {
            TaskStatus::Pending => {
                self.queue.assign(&task.id, "sandbox")?;
            }
            TaskStatus::Assigned => {}
            status => {
                debug!(task_id = %task.id, %status, "Task already beyond dispatch; skipping");
                return Ok(None);
            }
        }

        let overlaps = self.scope.register(&task.id, &task.scope);
        if !overlaps.is_empty() {
            info!(
                task_id = %task.id,
                overlaps = overlaps.len(),
                "Dispatching despite scope overlap"
            );
        }

        self.queue.start(&task.id)?;
        self.active.fetch_add(1, Ordering::SeqCst);

        let outcome = self.execute(&current).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.scope.release(&task.id);
        self.tool_calls.lock().remove(&task.id);
        drop(permit);

        self.settle(&current, outcome, forward).map(Some)
    }

    async fn execute(&self, task: &Task) -> Result<Handoff> {
        let payload = WorkerPayload::new(
            task.clone(),
            self.runner_config.system_prompt.clone(),
            &self.git_config,
            &self.llm_config,
        );

        let sink = self.line_sink(task.id.clone());
        let timeout = Duration::from_secs(self.config.worker_timeout_secs);
        self.runner.run(&payload, timeout, sink).await
    }

    fn line_sink(&self, task_id: String) -> super::sandbox::LineSink {
        let counts = Arc::clone(&self.tool_calls);
        Arc::new(move |line: WorkerLine| match line {
            WorkerLine::Spawn(text) => {
                debug!(task_id = %task_id, "{}", text);
            }
            WorkerLine::Progress {
                task_id,
                text,
                tool_calls,
            } => {
                if let Some(count) = tool_calls {
                    counts.lock().insert(task_id.clone(), count);
                }
                debug!(task_id = %task_id, "{}", text);
            }
            WorkerLine::Raw(text) => {
                debug!(task_id = %task_id, raw = %text, "Worker output");
            }
        })
    }

    fn settle(&self, task: &Task, outcome: Result<Handoff>, forward: bool) -> Result<Handoff> {
        match outcome {
            Ok(handoff) => self.settle_handoff(task, handoff, forward),
            Err(ArmadaError::WorkerTimeout {
                task_id,
                timeout_secs,
            }) => {
                warn!(task_id = %task_id, timeout_secs, "Worker timed out; sandbox killed");
                self.timed_out_branches.lock().insert(task.branch.clone());
                self.queue.fail(&task_id)?;
                self.notify(&DispatchEvent::WorkerTimeout {
                    task_id: task_id.clone(),
                    branch: task.branch.clone(),
                });
                let handoff = Handoff::failure(
                    &task_id,
                    format!("worker timed out after {}s", timeout_secs),
                );
                if forward {
                    let _ = self.handoff_tx.send(handoff.clone());
                }
                Ok(handoff)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Dispatch failed");
                self.queue.fail(&task.id)?;
                self.notify(&DispatchEvent::WorkerFailed {
                    task_id: task.id.clone(),
                    message: e.to_string(),
                });
                let handoff = Handoff::failure(&task.id, e.to_string());
                if forward {
                    let _ = self.handoff_tx.send(handoff.clone());
                }
                Ok(handoff)
            }
        }
    }

    fn settle_handoff(&self, task: &Task, handoff: Handoff, forward: bool) -> Result<Handoff> {
        if handoff.task_id != task.id {
            let message = format!(
                "handoff task id '{}' does not match dispatched task",
                handoff.task_id
            );
            self.queue.fail(&task.id)?;
            self.notify(&DispatchEvent::WorkerFailed {
                task_id: task.id.clone(),
                message: message.clone(),
            });
            let handoff = Handoff::failure(&task.id, message);
            if forward {
                let _ = self.handoff_tx.send(handoff.clone());
            }
            return Ok(handoff);
        }

        match handoff.status {
            HandoffStatus::Complete | HandoffStatus::Partial => {
                self.queue.complete(&task.id)?;
            }
            HandoffStatus::Failed => {
                self.queue.fail(&task.id)?;
            }
            HandoffStatus::Blocked => {
                self.queue.block(&task.id)?;
            }
        }

        if handoff.is_empty_diff() {
            self.notify(&DispatchEvent::EmptyDiff {
                task_id: task.id.clone(),
            });
        }
        if handoff.is_suspicious() {
            self.notify(&DispatchEvent::SuspiciousTask {
                task_id: task.id.clone(),
            });
        }

        info!(
            task_id = %task.id,
            status = %handoff.status,
            files = handoff.files_changed.len(),
            tokens = handoff.metrics.tokens_used,
            "Task settled"
        );

        self.notify(&DispatchEvent::TaskComplete(handoff.clone()));
        if forward {
            let _ = self.handoff_tx.send(handoff.clone());
        }
        Ok(handoff)
    }
}
