use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::error::{ArmadaError, Result};
use crate::git::GitRunner;
use crate::llm::{ChatMessage, LlmClient};
use crate::merge::MergeQueue;
use crate::planner::parse_task_array;
use crate::queue::Task;
use crate::utils::truncate_with_marker;

/// Output patterns meaning a check command simply is not set up in the
/// target repo; these count as success regardless of exit code.
const NOT_CONFIGURED_PATTERNS: &[&str] = &[
    "not configured",
    "command not found",
    "missing script",
    "no test specified",
    "could not determine executable",
];

/// Consecutive green sweeps before the interval returns to its ceiling.
const GREEN_STREAK_FOR_RESET: u32 = 3;

/// Hard floor on the tightened sweep interval.
const INTERVAL_FLOOR_MS: u64 = 60_000;

const OUTPUT_TRUNCATE: usize = 4000;

/// One sweep's verdict, delivered to subscribers. Fix tasks are never
/// enqueued here; the orchestrator decides to inject them.
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub build_ok: bool,
    pub tests_ok: bool,
    pub has_conflict_markers: bool,
    pub conflict_files: Vec<String>,
    pub fix_tasks: Vec<Task>,
    pub build_output: String,
    pub test_output: String,
    /// Merges landed mid-sweep, so the command outputs describe a stale
    /// tree; no fix tasks were generated.
    pub stale: bool,
}

impl SweepResult {
    pub fn is_green(&self) -> bool {
        self.build_ok && self.tests_ok && !self.has_conflict_markers
    }
}

/// Periodic build/test/conflict sweeper with adaptive cadence: failures
/// tighten the interval to the floor, three consecutive greens restore the
/// ceiling.
pub struct Reconciler {
    config: ReconcilerConfig,
    repo_path: PathBuf,
    git: GitRunner,
    llm: Arc<dyn LlmClient>,
    merge_queue: Arc<MergeQueue>,
    branch_prefix: String,

    interval_ms: AtomicU64,
    green_streak: AtomicU32,
    fix_counter: AtomicU64,
    recent_fix_scopes: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        repo_path: impl Into<PathBuf>,
        llm: Arc<dyn LlmClient>,
        merge_queue: Arc<MergeQueue>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        let repo_path = repo_path.into();
        let interval = config.interval_ms;
        Self {
            config,
            git: GitRunner::new(&repo_path),
            repo_path,
            llm,
            merge_queue,
            branch_prefix: branch_prefix.into(),
            interval_ms: AtomicU64::new(interval),
            green_streak: AtomicU32::new(0),
            fix_counter: AtomicU64::new(0),
            recent_fix_scopes: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    fn interval_floor(&self) -> u64 {
        INTERVAL_FLOOR_MS.min(self.config.min_interval_ms.max(1))
    }

    /// Run one sweep: build check, build, tests, conflict-marker scan, and
    /// (when failing) a model request for targeted fix tasks.
    pub async fn sweep(&self) -> Result<SweepResult> {
        let merged_before = self.merge_queue.stats().total_merged;

        let build_check = self.run_check(&self.config.build_check_command).await;
        let build = self.run_check(&self.config.build_command).await;
        let tests = self.run_check(&self.config.test_command).await;

        let conflict_files = self.git.conflict_marker_files().await.unwrap_or_default();
        let has_conflict_markers = !conflict_files.is_empty();

        let build_ok = build_check.ok && build.ok;
        let tests_ok = tests.ok;
        let build_output = format!("{}\n{}", build_check.output, build.output)
            .trim()
            .to_string();
        let test_output = tests.output;

        if build_ok && tests_ok && !has_conflict_markers {
            let streak = self.green_streak.fetch_add(1, Ordering::SeqCst) + 1;
            self.recent_fix_scopes.lock().clear();
            if streak >= GREEN_STREAK_FOR_RESET {
                self.interval_ms
                    .store(self.config.interval_ms, Ordering::Relaxed);
            }
            info!(streak, "Sweep green");
            return Ok(SweepResult {
                build_ok: true,
                tests_ok: true,
                has_conflict_markers: false,
                conflict_files: Vec::new(),
                fix_tasks: Vec::new(),
                build_output,
                test_output,
                stale: false,
            });
        }

        self.green_streak.store(0, Ordering::SeqCst);

        let merged_after = self.merge_queue.stats().total_merged;
        if merged_after > merged_before {
            debug!(
                merged_before,
                merged_after, "Merges landed during sweep; results stale"
            );
            return Ok(SweepResult {
                build_ok,
                tests_ok,
                has_conflict_markers,
                conflict_files,
                fix_tasks: Vec::new(),
                build_output,
                test_output,
                stale: true,
            });
        }

        let fix_tasks = match self
            .generate_fix_tasks(&build_output, &test_output, &conflict_files)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                // Abandon this sweep's fix generation; the next cycle
                // retries with a tightened interval.
                warn!(error = %e, "Fix-task generation failed");
                Vec::new()
            }
        };

        self.interval_ms.store(self.interval_floor(), Ordering::Relaxed);
        info!(
            build_ok,
            tests_ok,
            conflicts = conflict_files.len(),
            fix_tasks = fix_tasks.len(),
            "Sweep failed; interval tightened"
        );

        Ok(SweepResult {
            build_ok,
            tests_ok,
            has_conflict_markers,
            conflict_files,
            fix_tasks,
            build_output,
            test_output,
            stale: false,
        })
    }

    async fn generate_fix_tasks(
        &self,
        build_output: &str,
        test_output: &str,
        conflict_files: &[String],
    ) -> Result<Vec<Task>> {
        let recent_commits = self.git.recent_commits(10).await.unwrap_or_default();
        let pending_scopes: Vec<String> = {
            let scopes = self.recent_fix_scopes.lock();
            let mut v: Vec<String> = scopes.iter().cloned().collect();
            v.sort();
            v
        };

        let prompt = format!(
            "The target repository is failing its health checks. Produce a JSON \
             array of at most {max} fix tasks, each an object with \"description\" \
             (imperative, specific) and \"scope\" (repo-relative file paths to \
             touch). Do not repeat work already pending.\n\n\
             Build output:\n{build}\n\n\
             Test output:\n{test}\n\n\
             Recent commits:\n{commits}\n\
             Fix scopes already pending: {pending:?}\n\
             Files with unresolved conflict markers: {conflicts:?}\n",
            max = self.config.max_fix_tasks,
            build = truncate_with_marker(build_output, OUTPUT_TRUNCATE),
            test = truncate_with_marker(test_output, OUTPUT_TRUNCATE),
            commits = recent_commits,
            pending = pending_scopes,
            conflicts = conflict_files,
        );

        let messages = [ChatMessage::user(prompt)];
        let llm_timeout = Duration::from_millis(self.config.llm_timeout_ms);
        let completion = tokio::time::timeout(llm_timeout, self.llm.complete(&messages))
            .await
            .map_err(|_| ArmadaError::Timeout("reconciler LLM call".to_string()))??;

        let planned = parse_task_array(&completion.text)?;

        let mut tasks = Vec::new();
        let mut scopes = self.recent_fix_scopes.lock();
        for spec in planned.into_iter().take(self.config.max_fix_tasks) {
            // Skip fixes wholly covered by scopes already being fixed.
            if !spec.scope.is_empty() && spec.scope.iter().all(|f| scopes.contains(f)) {
                debug!(scope = ?spec.scope, "Dropping duplicate fix task");
                continue;
            }

            let id = format!("fix-{:03}", self.fix_counter.fetch_add(1, Ordering::SeqCst) + 1);
            let task = Task::new(&id, &spec.description, &self.branch_prefix)
                .with_scope(spec.scope.clone())
                .with_acceptance(spec.acceptance)
                .with_priority(1);

            for file in &spec.scope {
                scopes.insert(file.clone());
            }
            tasks.push(task);
        }

        Ok(tasks)
    }

    async fn run_check(&self, command: &str) -> CheckOutcome {
        if command.trim().is_empty() {
            return CheckOutcome {
                ok: true,
                output: String::new(),
            };
        }

        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.repo_path)
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                return CheckOutcome {
                    ok: false,
                    output: format!("failed to run '{}': {}", command, e),
                };
            }
        };

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .trim()
        .to_string();

        if output.status.success() {
            return CheckOutcome {
                ok: true,
                output: combined,
            };
        }

        let lower = combined.to_lowercase();
        let not_configured = NOT_CONFIGURED_PATTERNS
            .iter()
            .any(|pattern| lower.contains(pattern));

        CheckOutcome {
            ok: not_configured,
            output: combined,
        }
    }

    /// Spawn the periodic sweep loop; each result goes to `tx`.
    pub fn start_background(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<SweepResult>,
    ) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let reconciler = self;
        tokio::spawn(async move {
            while reconciler.running.load(Ordering::SeqCst) {
                let interval = Duration::from_millis(reconciler.current_interval_ms());
                tokio::time::sleep(interval).await;
                if !reconciler.running.load(Ordering::SeqCst) {
                    break;
                }
                match reconciler.sweep().await {
                    Ok(result) => {
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Sweep errored");
                    }
                }
            }
            debug!("Reconciler loop stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct CheckOutcome {
    ok: bool,
    output: String,
}
