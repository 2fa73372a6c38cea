use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Point-in-time view of run health; written to the event log and returned
/// from `run()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub blocked_tasks: u64,
    pub pending_tasks: u64,
    pub active_workers: u64,
    pub total_tokens_used: u64,
    pub total_merged: u64,
    pub total_merge_skipped: u64,
    pub total_merge_failed: u64,
    pub total_conflicts: u64,
    pub merge_queue_depth: u64,
    pub fix_tasks_injected: u64,
    pub conflict_fix_tasks_injected: u64,
    pub empty_diff_handoffs: u64,
    pub suspicious_handoffs: u64,
    pub worker_timeouts: u64,
    pub planner_iterations: u64,
    pub commits_per_hour: f64,
    pub elapsed_secs: u64,
    pub finalization_passed: Option<bool>,
}

/// Task-state and queue gauges sampled by the caller at snapshot time; task
/// counts come from the task queue so retried tasks are never double-counted.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeSample {
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub blocked_tasks: u64,
    pub pending_tasks: u64,
    pub active_workers: u64,
    pub merge_queue_depth: u64,
}

/// Atomic counter registry shared across components.
pub struct MetricsRegistry {
    started: Instant,
    tokens_used: AtomicU64,
    merged: AtomicU64,
    merge_skipped: AtomicU64,
    merge_failed: AtomicU64,
    conflicts: AtomicU64,
    fix_tasks: AtomicU64,
    conflict_fix_tasks: AtomicU64,
    empty_diffs: AtomicU64,
    suspicious: AtomicU64,
    worker_timeouts: AtomicU64,
    planner_iterations: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            tokens_used: AtomicU64::new(0),
            merged: AtomicU64::new(0),
            merge_skipped: AtomicU64::new(0),
            merge_failed: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            fix_tasks: AtomicU64::new(0),
            conflict_fix_tasks: AtomicU64::new(0),
            empty_diffs: AtomicU64::new(0),
            suspicious: AtomicU64::new(0),
            worker_timeouts: AtomicU64::new(0),
            planner_iterations: AtomicU64::new(0),
        }
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.tokens_used.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_skipped(&self) {
        self.merge_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_failed(&self) {
        self.merge_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fix_task(&self) {
        self.fix_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_fix_task(&self) {
        self.conflict_fix_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_diff(&self) {
        self.empty_diffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspicious(&self) {
        self.suspicious.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_timeout(&self) {
        self.worker_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_planner_iteration(&self) {
        self.planner_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_merged(&self) -> u64 {
        self.merged.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, gauges: GaugeSample) -> MetricsSnapshot {
        let elapsed = self.started.elapsed();
        let merged = self.merged.load(Ordering::Relaxed);
        let hours = elapsed.as_secs_f64() / 3600.0;
        let commits_per_hour = if hours > 0.0 {
            merged as f64 / hours
        } else {
            0.0
        };

        MetricsSnapshot {
            completed_tasks: gauges.completed_tasks,
            failed_tasks: gauges.failed_tasks,
            blocked_tasks: gauges.blocked_tasks,
            pending_tasks: gauges.pending_tasks,
            active_workers: gauges.active_workers,
            total_tokens_used: self.tokens_used.load(Ordering::Relaxed),
            total_merged: merged,
            total_merge_skipped: self.merge_skipped.load(Ordering::Relaxed),
            total_merge_failed: self.merge_failed.load(Ordering::Relaxed),
            total_conflicts: self.conflicts.load(Ordering::Relaxed),
            merge_queue_depth: gauges.merge_queue_depth,
            fix_tasks_injected: self.fix_tasks.load(Ordering::Relaxed),
            conflict_fix_tasks_injected: self.conflict_fix_tasks.load(Ordering::Relaxed),
            empty_diff_handoffs: self.empty_diffs.load(Ordering::Relaxed),
            suspicious_handoffs: self.suspicious.load(Ordering::Relaxed),
            worker_timeouts: self.worker_timeouts.load(Ordering::Relaxed),
            planner_iterations: self.planner_iterations.load(Ordering::Relaxed),
            commits_per_hour,
            elapsed_secs: elapsed.as_secs(),
            finalization_passed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.record_tokens(250);
        metrics.record_merge();

        let snapshot = metrics.snapshot(GaugeSample {
            completed_tasks: 2,
            failed_tasks: 1,
            pending_tasks: 3,
            merge_queue_depth: 2,
            ..GaugeSample::default()
        });
        assert_eq!(snapshot.completed_tasks, 2);
        assert_eq!(snapshot.failed_tasks, 1);
        assert_eq!(snapshot.total_tokens_used, 250);
        assert_eq!(snapshot.total_merged, 1);
        assert_eq!(snapshot.pending_tasks, 3);
        assert_eq!(snapshot.merge_queue_depth, 2);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let metrics = MetricsRegistry::new();
        let json = serde_json::to_value(metrics.snapshot(GaugeSample::default())).unwrap();
        assert!(json.get("completedTasks").is_some());
        assert!(json.get("totalMerged").is_some());
        assert!(json.get("commitsPerHour").is_some());
    }
}
