//! Mock sandbox runner: scripted per-task outcomes with concurrency
//! accounting, plus an optional real-git mode that commits to a branch the
//! way a sandbox worker would.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use armada::dispatch::{LineSink, SandboxRunner, WorkerLine, WorkerPayload};
use armada::error::{ArmadaError, Result};
use armada::git::GitRunner;
use armada::queue::{Handoff, HandoffMetrics, HandoffStatus};

#[derive(Debug, Clone)]
pub enum RunnerScript {
    /// Return a complete handoff reporting these files changed.
    Complete { files: Vec<String>, tokens: u64 },
    /// Create the task branch in the repo, commit `content` to `file`, and
    /// report success.
    CommitAndComplete { file: String, content: String },
    /// Return a failed handoff.
    FailedHandoff { summary: String },
    /// Return a blocked handoff.
    BlockedHandoff { summary: String },
    /// Fail the dispatch itself (runner never produced a handoff).
    DispatchError { message: String },
    /// Simulate hitting the wall clock.
    Timeout,
}

pub struct MockSandboxRunner {
    repo_path: Option<PathBuf>,
    default: RunnerScript,
    per_task: Mutex<HashMap<String, RunnerScript>>,
    delay: Duration,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    invocations: Mutex<Vec<String>>,
}

impl MockSandboxRunner {
    pub fn new(default: RunnerScript) -> Self {
        Self {
            repo_path: None,
            default,
            per_task: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(0),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Enable CommitAndComplete scripts against this working copy.
    pub fn with_repo(mut self, repo_path: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(repo_path.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script_task(self, task_id: &str, script: RunnerScript) -> Self {
        self.per_task.lock().insert(task_id.to_string(), script);
        self
    }

    /// Highest concurrent invocation count observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().clone()
    }

    fn script_for(&self, task_id: &str) -> RunnerScript {
        self.per_task
            .lock()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    async fn commit_to_branch(&self, payload: &WorkerPayload, file: &str, content: &str) {
        let repo = self
            .repo_path
            .as_ref()
            .expect("CommitAndComplete requires with_repo");
        let git = GitRunner::new(repo);
        let branch = &payload.task.branch;

        git.run_checked(&["checkout", "-b", branch, "main"])
            .await
            .unwrap();
        let full = repo.join(file);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&full, content).await.unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", &format!("worker: {}", payload.task.description)])
            .await
            .unwrap();
        git.run_checked(&["checkout", "main"]).await.unwrap();
    }
}

fn handoff(task_id: &str, status: HandoffStatus, files: Vec<String>, tokens: u64) -> Handoff {
    Handoff {
        task_id: task_id.to_string(),
        status,
        summary: format!("mock worker finished {}", task_id),
        diff: String::new(),
        files_changed: files,
        concerns: Vec::new(),
        suggestions: Vec::new(),
        metrics: HandoffMetrics {
            lines_added: 1,
            tokens_used: tokens,
            tool_call_count: if tokens > 0 { 3 } else { 0 },
            duration_ms: 10,
            ..HandoffMetrics::default()
        },
    }
}

#[async_trait]
impl SandboxRunner for MockSandboxRunner {
    async fn run(
        &self,
        payload: &WorkerPayload,
        timeout: Duration,
        lines: LineSink,
    ) -> Result<Handoff> {
        let task_id = payload.task.id.clone();
        self.invocations.lock().push(task_id.clone());

        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(current, Ordering::SeqCst);

        lines(WorkerLine::classify(&format!(
            "[spawn] sandbox created for task {}",
            task_id
        )));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match self.script_for(&task_id) {
            RunnerScript::Complete { files, tokens } => {
                Ok(handoff(&task_id, HandoffStatus::Complete, files, tokens))
            }
            RunnerScript::CommitAndComplete { file, content } => {
                self.commit_to_branch(payload, &file, &content).await;
                Ok(handoff(
                    &task_id,
                    HandoffStatus::Complete,
                    vec![file],
                    100,
                ))
            }
            RunnerScript::FailedHandoff { summary } => {
                let mut h = handoff(&task_id, HandoffStatus::Failed, Vec::new(), 10);
                h.summary = summary;
                Ok(h)
            }
            RunnerScript::BlockedHandoff { summary } => {
                let mut h = handoff(&task_id, HandoffStatus::Blocked, Vec::new(), 10);
                h.summary = summary;
                Ok(h)
            }
            RunnerScript::DispatchError { message } => Err(ArmadaError::Dispatch {
                task_id: task_id.clone(),
                message,
            }),
            RunnerScript::Timeout => Err(ArmadaError::WorkerTimeout {
                task_id: task_id.clone(),
                timeout_secs: timeout.as_secs(),
            }),
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
