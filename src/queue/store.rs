use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::task::{Task, TaskStatus};
use crate::error::{ArmadaError, Result};

/// Fired on every status change with the task id and its new status.
pub type StatusObserver = Box<dyn Fn(&str, TaskStatus) + Send + Sync>;

/// Heap entry ordered by (priority, created_at, admission seq). The heap is
/// lazy: entries for tasks that have left `Pending` are skipped on pop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for min-ordering.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of tasks plus a by-id index. Single writer of task state;
/// all mutations go through the documented transitions.
pub struct TaskQueue {
    tasks: RwLock<HashMap<String, Task>>,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    next_seq: Mutex<u64>,
    max_retries: u32,
    observers: RwLock<Vec<StatusObserver>>,
}

impl TaskQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: Mutex::new(0),
            max_retries,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn on_status_change(&self, observer: StatusObserver) {
        self.observers.write().push(observer);
    }

    fn notify(&self, task_id: &str, status: TaskStatus) {
        for observer in self.observers.read().iter() {
            observer(task_id, status);
        }
    }

    fn push_heap(&self, task: &Task) {
        let mut seq = self.next_seq.lock();
        let entry = HeapEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: *seq,
            task_id: task.id.clone(),
        };
        *seq += 1;
        self.heap.lock().push(entry);
    }

    /// Insert a new task with status `pending`. Fails if the id is taken.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        let mut task = task;
        task.status = TaskStatus::Pending;
        {
            let mut tasks = self.tasks.write();
            if tasks.contains_key(&task.id) {
                return Err(ArmadaError::TaskAlreadyExists(task.id));
            }
            tasks.insert(task.id.clone(), task.clone());
        }
        self.push_heap(&task);
        debug!(task_id = %task.id, priority = task.priority, "Task enqueued");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    /// Pop the highest-priority task still pending, if any.
    pub fn next_pending(&self) -> Option<Task> {
        let mut heap = self.heap.lock();
        let tasks = self.tasks.read();
        while let Some(entry) = heap.pop() {
            if let Some(task) = tasks.get(&entry.task_id) {
                if task.status == TaskStatus::Pending {
                    return Some(task.clone());
                }
            }
        }
        None
    }

    fn transition(&self, id: &str, to: TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ArmadaError::TaskNotFound(id.to_string()))?;

        if !task.status.can_transition_to(to) {
            return Err(ArmadaError::InvalidTaskTransition {
                task_id: id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }
        task.status = to;
        drop(tasks);

        self.notify(id, to);
        Ok(())
    }

    /// pending -> assigned, recording the assignee tag.
    pub fn assign(&self, id: &str, agent: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| ArmadaError::TaskNotFound(id.to_string()))?;
            if !task.status.can_transition_to(TaskStatus::Assigned) {
                return Err(ArmadaError::InvalidTaskTransition {
                    task_id: id.to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Assigned.to_string(),
                });
            }
            task.status = TaskStatus::Assigned;
            task.assignee = Some(agent.to_string());
        }
        self.notify(id, TaskStatus::Assigned);
        Ok(())
    }

    /// assigned -> running.
    pub fn start(&self, id: &str) -> Result<()> {
        self.transition(id, TaskStatus::Running)
    }

    /// running -> complete.
    pub fn complete(&self, id: &str) -> Result<()> {
        self.transition(id, TaskStatus::Complete)
    }

    /// running -> failed.
    pub fn fail(&self, id: &str) -> Result<()> {
        self.transition(id, TaskStatus::Failed)
    }

    /// running -> blocked.
    pub fn block(&self, id: &str) -> Result<()> {
        self.transition(id, TaskStatus::Blocked)
    }

    /// failed -> pending, bounded by the retry budget. The re-admitted task
    /// goes back on the heap at its original priority.
    pub fn retry(&self, id: &str) -> Result<()> {
        let task = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| ArmadaError::TaskNotFound(id.to_string()))?;

            if !task.status.can_transition_to(TaskStatus::Pending) {
                return Err(ArmadaError::InvalidTaskTransition {
                    task_id: id.to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Pending.to_string(),
                });
            }
            if task.retry_count >= self.max_retries {
                return Err(ArmadaError::RetryBudgetExhausted {
                    task_id: id.to_string(),
                    retries: task.retry_count,
                    max: self.max_retries,
                });
            }
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.assignee = None;
            task.clone()
        };

        self.push_heap(&task);
        self.notify(id, TaskStatus::Pending);
        debug!(task_id = %id, retry = task.retry_count, "Task re-admitted for retry");
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.count_with_status(TaskStatus::Pending)
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status.is_active())
            .count()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status.is_active())
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
