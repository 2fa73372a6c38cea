use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::parse::parse_task_array;
use crate::config::PlannerConfig;
use crate::dispatch::WorkerDispatcher;
use crate::error::Result;
use crate::llm::{LlmClient, LlmSession};
use crate::queue::{Handoff, HandoffMetrics, HandoffStatus, Task, TaskQueue};

/// Recursive task decomposition: a task whose scope is wide enough is split
/// by a short-lived model session into children that execute concurrently;
/// their handoffs aggregate into a single parent handoff.
pub struct Subplanner {
    queue: Arc<TaskQueue>,
    dispatcher: Arc<WorkerDispatcher>,
    llm: Arc<dyn LlmClient>,
    config: PlannerConfig,
    branch_prefix: String,
    handoff_tx: mpsc::UnboundedSender<Handoff>,
}

impl Subplanner {
    pub fn new(
        queue: Arc<TaskQueue>,
        dispatcher: Arc<WorkerDispatcher>,
        llm: Arc<dyn LlmClient>,
        config: PlannerConfig,
        branch_prefix: impl Into<String>,
        handoff_tx: mpsc::UnboundedSender<Handoff>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            llm,
            config,
            branch_prefix: branch_prefix.into(),
            handoff_tx,
        }
    }

    pub fn should_decompose(&self, task: &Task, depth: u32) -> bool {
        task.scope.len() >= self.config.decompose_scope_threshold
            && depth < self.config.max_decompose_depth
    }

    /// Decompose and execute the (already-enqueued) task, forwarding the
    /// aggregated handoff to the planner channel. Falls back to a direct
    /// dispatch when the model produces no usable split.
    pub async fn run(&self, task: Task, depth: u32) -> Result<()> {
        match self.run_collect(task.clone(), depth).await {
            Ok(Some(handoff)) => {
                let _ = self.handoff_tx.send(handoff);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Decomposition failed");
                Err(e)
            }
        }
    }

    /// Recursion-friendly core: returns the aggregate handoff instead of
    /// forwarding it.
    fn run_collect(&self, task: Task, depth: u32) -> BoxFuture<'_, Result<Option<Handoff>>> {
        Box::pin(async move {
            let specs = match self.split(&task).await {
                Ok(specs) if !specs.is_empty() => specs,
                Ok(_) => {
                    debug!(task_id = %task.id, "No subtasks produced; dispatching directly");
                    return self.dispatcher.dispatch_quiet(task).await;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Split failed; dispatching directly");
                    return self.dispatcher.dispatch_quiet(task).await;
                }
            };

            // The parent occupies no sandbox; it is tracked as running while
            // its children execute.
            self.queue.assign(&task.id, "subplanner")?;
            self.queue.start(&task.id)?;

            let children: Vec<Task> = specs
                .into_iter()
                .take(self.config.max_subtasks)
                .enumerate()
                .map(|(i, spec)| {
                    let id = format!("{}-s{}", task.id, i + 1);
                    let scope = filter_to_parent(&spec.scope, &task.scope);
                    Task::new(&id, &spec.description, &self.branch_prefix)
                        .with_scope(scope)
                        .with_acceptance(spec.acceptance)
                        .with_priority(task.priority)
                        .with_parent(&task.id)
                })
                .collect();

            info!(
                task_id = %task.id,
                children = children.len(),
                depth,
                "Task decomposed"
            );

            let futures = children.into_iter().map(|child| async move {
                if let Err(e) = self.queue.enqueue(child.clone()) {
                    debug!(task_id = %child.id, error = %e, "Child enqueue failed");
                    return None;
                }
                let result = if self.should_decompose(&child, depth + 1) {
                    self.run_collect(child.clone(), depth + 1).await
                } else {
                    self.dispatcher.dispatch_quiet(child.clone()).await
                };
                match result {
                    Ok(handoff) => handoff,
                    Err(e) => {
                        warn!(task_id = %child.id, error = %e, "Child execution failed");
                        Some(Handoff::failure(&child.id, e.to_string()))
                    }
                }
            });

            let handoffs: Vec<Handoff> = join_all(futures).await.into_iter().flatten().collect();
            let aggregate = aggregate_handoffs(&task.id, &handoffs);

            match aggregate.status {
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

            Ok(Some(aggregate))
        })
    }

    async fn split(&self, task: &Task) -> Result<Vec<super::parse::PlannedTask>> {
        let session = LlmSession::new(Arc::clone(&self.llm), None);
        let prompt = format!(
            "Split the following task into at most {max} independent subtasks, \
             each an object with \"description\" and \"scope\" (a subset of the \
             parent's files). Reply with a JSON array only.\n\n\
             Task: {description}\n\
             Acceptance: {acceptance}\n\
             Files: {scope:?}\n",
            max = self.config.max_subtasks,
            description = task.description,
            acceptance = task.acceptance,
            scope = task.scope,
        );
        let completion = session.prompt(prompt).await?;
        session.close().await;
        parse_task_array(&completion.text)
    }
}

fn filter_to_parent(child_scope: &[String], parent_scope: &[String]) -> Vec<String> {
    if parent_scope.is_empty() {
        return child_scope.to_vec();
    }
    child_scope
        .iter()
        .filter(|f| parent_scope.contains(*f))
        .cloned()
        .collect()
}

/// Fold child handoffs into one parent handoff: complete if all children
/// completed, failed if all failed, partial when mixed, blocked otherwise.
/// Metrics are summed except duration, which is the slowest child.
pub(crate) fn aggregate_handoffs(parent_id: &str, handoffs: &[Handoff]) -> Handoff {
    if handoffs.is_empty() {
        return Handoff::failure(parent_id, "decomposition produced no child results");
    }

    let statuses: Vec<HandoffStatus> = handoffs.iter().map(|h| h.status).collect();
    let status = aggregate_status(&statuses);

    let mut metrics = HandoffMetrics::default();
    let mut files_changed = Vec::new();
    let mut concerns = Vec::new();
    let mut suggestions = Vec::new();
    let mut summaries = Vec::new();

    for handoff in handoffs {
        metrics.lines_added += handoff.metrics.lines_added;
        metrics.lines_removed += handoff.metrics.lines_removed;
        metrics.files_created += handoff.metrics.files_created;
        metrics.files_modified += handoff.metrics.files_modified;
        metrics.tokens_used += handoff.metrics.tokens_used;
        metrics.tool_call_count += handoff.metrics.tool_call_count;
        metrics.duration_ms = metrics.duration_ms.max(handoff.metrics.duration_ms);

        for file in &handoff.files_changed {
            if !files_changed.contains(file) {
                files_changed.push(file.clone());
            }
        }
        concerns.extend(handoff.concerns.iter().cloned());
        suggestions.extend(handoff.suggestions.iter().cloned());
        summaries.push(format!("[{}] {}", handoff.task_id, handoff.summary));
    }

    Handoff {
        task_id: parent_id.to_string(),
        status,
        summary: summaries.join("\n"),
        diff: String::new(),
        files_changed,
        concerns,
        suggestions,
        metrics,
    }
}

fn aggregate_status(statuses: &[HandoffStatus]) -> HandoffStatus {
    let all_complete = statuses.iter().all(|s| *s == HandoffStatus::Complete);
    if all_complete {
        return HandoffStatus::Complete;
    }
    let all_failed = statuses.iter().all(|s| *s == HandoffStatus::Failed);
    if all_failed {
        return HandoffStatus::Failed;
    }
    let any_progress = statuses
        .iter()
        .any(|s| matches!(s, HandoffStatus::Complete | HandoffStatus::Partial));
    if any_progress {
        HandoffStatus::Partial
    } else {
        HandoffStatus::Blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handoff(id: &str, status: HandoffStatus, tokens: u64, duration: u64) -> Handoff {
        Handoff {
            task_id: id.to_string(),
            status,
            summary: format!("{} done", id),
            diff: String::new(),
            files_changed: vec![format!("{}.ts", id)],
            concerns: Vec::new(),
            suggestions: Vec::new(),
            metrics: HandoffMetrics {
                tokens_used: tokens,
                duration_ms: duration,
                ..HandoffMetrics::default()
            },
        }
    }

    #[test]
    fn test_aggregate_all_complete() {
        let handoffs = vec![
            handoff("a", HandoffStatus::Complete, 100, 50),
            handoff("b", HandoffStatus::Complete, 200, 90),
        ];
        let agg = aggregate_handoffs("parent", &handoffs);
        assert_eq!(agg.status, HandoffStatus::Complete);
        assert_eq!(agg.metrics.tokens_used, 300);
        assert_eq!(agg.metrics.duration_ms, 90);
        assert_eq!(agg.files_changed, vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn test_aggregate_all_failed() {
        let handoffs = vec![
            handoff("a", HandoffStatus::Failed, 10, 5),
            handoff("b", HandoffStatus::Failed, 10, 5),
        ];
        assert_eq!(
            aggregate_handoffs("p", &handoffs).status,
            HandoffStatus::Failed
        );
    }

    #[test]
    fn test_aggregate_mixed_is_partial() {
        let handoffs = vec![
            handoff("a", HandoffStatus::Complete, 10, 5),
            handoff("b", HandoffStatus::Failed, 10, 5),
        ];
        assert_eq!(
            aggregate_handoffs("p", &handoffs).status,
            HandoffStatus::Partial
        );
    }

    #[test]
    fn test_aggregate_blocked_without_progress() {
        let handoffs = vec![
            handoff("a", HandoffStatus::Blocked, 10, 5),
            handoff("b", HandoffStatus::Failed, 10, 5),
        ];
        assert_eq!(
            aggregate_handoffs("p", &handoffs).status,
            HandoffStatus::Blocked
        );
    }

    #[test]
    fn test_aggregate_empty_is_failure() {
        let agg = aggregate_handoffs("p", &[]);
        assert_eq!(agg.status, HandoffStatus::Failed);
    }

    #[test]
    fn test_filter_to_parent_scope() {
        let parent = vec!["a.ts".to_string(), "b.ts".to_string()];
        let child = vec!["b.ts".to_string(), "c.ts".to_string()];
        assert_eq!(filter_to_parent(&child, &parent), vec!["b.ts"]);

        // Empty parent scope imposes no filter.
        assert_eq!(filter_to_parent(&child, &[]), child);
    }
}
