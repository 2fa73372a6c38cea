//! External observer lists. Components talk to each other over channels;
//! these callbacks exist only for outside consumers (CLI, dashboards).

use parking_lot::RwLock;

use crate::metrics::MetricsSnapshot;
use crate::queue::{Handoff, Task, TaskStatus};
use crate::reconciler::SweepResult;

#[derive(Default)]
pub struct OrchestratorEvents {
    task_created: RwLock<Vec<Box<dyn Fn(&Task) + Send + Sync>>>,
    task_completed: RwLock<Vec<Box<dyn Fn(&Handoff) + Send + Sync>>>,
    iteration_complete: RwLock<Vec<Box<dyn Fn(u32, usize) + Send + Sync>>>,
    sweep_complete: RwLock<Vec<Box<dyn Fn(&SweepResult) + Send + Sync>>>,
    worker_timeout: RwLock<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
    empty_diff: RwLock<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
    suspicious_task: RwLock<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
    metrics_update: RwLock<Vec<Box<dyn Fn(&MetricsSnapshot) + Send + Sync>>>,
    task_status_change: RwLock<Vec<Box<dyn Fn(&str, TaskStatus) + Send + Sync>>>,
    finalization_start: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
    finalization_attempt: RwLock<Vec<Box<dyn Fn(u32, bool) + Send + Sync>>>,
    finalization_complete: RwLock<Vec<Box<dyn Fn(bool) + Send + Sync>>>,
    error: RwLock<Vec<Box<dyn Fn(&str, &str) + Send + Sync>>>,
}

impl OrchestratorEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_task_created(&self, f: impl Fn(&Task) + Send + Sync + 'static) {
        self.task_created.write().push(Box::new(f));
    }

    pub fn on_task_completed(&self, f: impl Fn(&Handoff) + Send + Sync + 'static) {
        self.task_completed.write().push(Box::new(f));
    }

    pub fn on_iteration_complete(&self, f: impl Fn(u32, usize) + Send + Sync + 'static) {
        self.iteration_complete.write().push(Box::new(f));
    }

    pub fn on_sweep_complete(&self, f: impl Fn(&SweepResult) + Send + Sync + 'static) {
        self.sweep_complete.write().push(Box::new(f));
    }

    pub fn on_worker_timeout(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.worker_timeout.write().push(Box::new(f));
    }

    pub fn on_empty_diff(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.empty_diff.write().push(Box::new(f));
    }

    pub fn on_suspicious_task(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.suspicious_task.write().push(Box::new(f));
    }

    pub fn on_metrics_update(&self, f: impl Fn(&MetricsSnapshot) + Send + Sync + 'static) {
        self.metrics_update.write().push(Box::new(f));
    }

    pub fn on_task_status_change(&self, f: impl Fn(&str, TaskStatus) + Send + Sync + 'static) {
        self.task_status_change.write().push(Box::new(f));
    }

    pub fn on_finalization_start(&self, f: impl Fn() + Send + Sync + 'static) {
        self.finalization_start.write().push(Box::new(f));
    }

    pub fn on_finalization_attempt(&self, f: impl Fn(u32, bool) + Send + Sync + 'static) {
        self.finalization_attempt.write().push(Box::new(f));
    }

    pub fn on_finalization_complete(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        self.finalization_complete.write().push(Box::new(f));
    }

    pub fn on_error(&self, f: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.error.write().push(Box::new(f));
    }

    pub(crate) fn fire_task_created(&self, task: &Task) {
        for f in self.task_created.read().iter() {
            f(task);
        }
    }

    pub(crate) fn fire_task_completed(&self, handoff: &Handoff) {
        for f in self.task_completed.read().iter() {
            f(handoff);
        }
    }

    pub(crate) fn fire_iteration_complete(&self, iteration: u32, new_tasks: usize) {
        for f in self.iteration_complete.read().iter() {
            f(iteration, new_tasks);
        }
    }

    pub(crate) fn fire_sweep_complete(&self, sweep: &SweepResult) {
        for f in self.sweep_complete.read().iter() {
            f(sweep);
        }
    }

    pub(crate) fn fire_worker_timeout(&self, task_id: &str) {
        for f in self.worker_timeout.read().iter() {
            f(task_id);
        }
    }

    pub(crate) fn fire_empty_diff(&self, task_id: &str) {
        for f in self.empty_diff.read().iter() {
            f(task_id);
        }
    }

    pub(crate) fn fire_suspicious_task(&self, task_id: &str) {
        for f in self.suspicious_task.read().iter() {
            f(task_id);
        }
    }

    pub(crate) fn fire_metrics_update(&self, snapshot: &MetricsSnapshot) {
        for f in self.metrics_update.read().iter() {
            f(snapshot);
        }
    }

    pub(crate) fn fire_task_status_change(&self, task_id: &str, status: TaskStatus) {
        for f in self.task_status_change.read().iter() {
            f(task_id, status);
        }
    }

    pub(crate) fn fire_finalization_start(&self) {
        for f in self.finalization_start.read().iter() {
            f();
        }
    }

    pub(crate) fn fire_finalization_attempt(&self, attempt: u32, passed: bool) {
        for f in self.finalization_attempt.read().iter() {
            f(attempt, passed);
        }
    }

    pub(crate) fn fire_finalization_complete(&self, passed: bool) {
        for f in self.finalization_complete.read().iter() {
            f(passed);
        }
    }

    pub(crate) fn fire_error(&self, component: &str, message: &str) {
        for f in self.error.read().iter() {
            f(component, message);
        }
    }
}
