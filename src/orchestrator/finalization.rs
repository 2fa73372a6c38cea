//! Terminal finalization: drain unmerged work, sweep, and self-heal within a
//! bounded number of attempts before the run returns.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::engine::Orchestrator;
use crate::reconciler::SweepResult;
use crate::state::RunEvent;

const QUIESCENCE_POLL_MS: u64 = 500;

/// Explicit states of the finalization machine. One attempt is one pass
/// through Drain -> ReEnqueueUnmerged -> Sweep -> Decide, with AwaitFixes
/// looping back to Drain when the model was given fix work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationState {
    Drain,
    ReEnqueueUnmerged,
    Sweep,
    Decide,
    AwaitFixes,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationOutcome {
    pub passed: bool,
    pub attempts: u32,
}

pub(super) struct FinalizationPhase<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> FinalizationPhase<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn run(&self) -> FinalizationOutcome {
        let orchestrator = self.orchestrator;
        let config = &orchestrator.config().finalization;
        let events = orchestrator.events_handle();
        let event_log = orchestrator.event_log_handle();
        let merge_queue = orchestrator.merge_queue();

        let initial_unmerged = orchestrator.unmerged_branches();
        info!(
            unmerged = initial_unmerged.len(),
            max_attempts = config.max_attempts,
            "Finalization starting"
        );
        events.fire_finalization_start();
        event_log.emit(RunEvent::FinalizationStarted {
            timestamp: Utc::now(),
            unmerged_branches: initial_unmerged.len(),
        });

        let mut state = FinalizationState::Drain;
        let mut attempt = 0u32;
        let mut passed = false;
        let mut last_sweep: Option<SweepResult> = None;

        loop {
            state = match state {
                FinalizationState::Drain => {
                    merge_queue.drain().await;
                    FinalizationState::ReEnqueueUnmerged
                }

                FinalizationState::ReEnqueueUnmerged => {
                    orchestrator.drain_timed_out_into_preserved();
                    let unmerged = orchestrator.unmerged_branches();
                    for branch in &unmerged {
                        merge_queue.reset_retry_count(branch);
                        merge_queue.enqueue(branch, 1);
                    }
                    if !unmerged.is_empty() {
                        debug!(count = unmerged.len(), "Re-enqueued unmerged branches");
                        merge_queue.drain().await;
                    }
                    FinalizationState::Sweep
                }

                FinalizationState::Sweep => {
                    attempt += 1;
                    let timeout = Duration::from_millis(config.sweep_timeout_ms.max(1));
                    last_sweep = match tokio::time::timeout(
                        timeout,
                        orchestrator.reconciler_handle().sweep(),
                    )
                    .await
                    {
                        Ok(Ok(sweep)) => Some(sweep),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Finalization sweep failed");
                            None
                        }
                        Err(_) => {
                            warn!("Finalization sweep timed out");
                            None
                        }
                    };
                    FinalizationState::Decide
                }

                FinalizationState::Decide => {
                    let unmerged = orchestrator.unmerged_branches();
                    let green = last_sweep.as_ref().map(SweepResult::is_green).unwrap_or(false);
                    let attempt_passed = green && unmerged.is_empty();

                    events.fire_finalization_attempt(attempt, attempt_passed);
                    event_log.emit(RunEvent::FinalizationAttempt {
                        timestamp: Utc::now(),
                        attempt,
                        passed: attempt_passed,
                    });

                    if attempt_passed {
                        passed = true;
                        FinalizationState::Done
                    } else {
                        let fix_tasks = last_sweep
                            .as_ref()
                            .map(|s| s.fix_tasks.len())
                            .unwrap_or(0);
                        if fix_tasks == 0 && unmerged.is_empty() {
                            // Checks are red with nothing to merge and no
                            // model-proposed repair: not recoverable here.
                            info!("Finalization giving up: no fix tasks, all branches merged");
                            FinalizationState::Done
                        } else if attempt >= config.max_attempts {
                            info!(attempt, "Finalization attempt budget exhausted");
                            FinalizationState::Done
                        } else {
                            FinalizationState::AwaitFixes
                        }
                    }
                }

                FinalizationState::AwaitFixes => {
                    let fix_tasks = last_sweep
                        .take()
                        .map(|s| s.fix_tasks)
                        .unwrap_or_default();
                    info!(count = fix_tasks.len(), "Injecting finalization fix tasks");
                    for task in fix_tasks {
                        orchestrator.planner().inject_task(task);
                    }
                    self.wait_for_quiescence(Duration::from_millis(config.sweep_timeout_ms))
                        .await;
                    FinalizationState::Drain
                }

                FinalizationState::Done => break,
            };
        }

        info!(passed, attempts = attempt, "Finalization finished");
        FinalizationOutcome {
            passed,
            attempts: attempt,
        }
    }

    /// Poll until no task is pending or in flight, or the attempt budget
    /// elapses.
    async fn wait_for_quiescence(&self, timeout: Duration) {
        let queue = self.orchestrator.queue_handle();
        let dispatcher = self.orchestrator.dispatcher_handle();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let busy = queue.pending_count() > 0
                || queue.active_count() > 0
                || dispatcher.active_count() > 0;
            if !busy {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Timed out waiting for finalization fix tasks");
                return;
            }
            tokio::time::sleep(Duration::from_millis(QUIESCENCE_POLL_MS)).await;
        }
    }
}
