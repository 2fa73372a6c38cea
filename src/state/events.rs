//! Structured run events, one JSON object per event-log line. The log is the
//! external contract for dashboards and replays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;
use crate::queue::{HandoffStatus, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        timestamp: DateTime<Utc>,
        request: String,
    },
    TaskCreated {
        timestamp: DateTime<Utc>,
        task_id: String,
        branch: String,
        priority: i32,
        scope: Vec<String>,
    },
    TaskStatusChanged {
        timestamp: DateTime<Utc>,
        task_id: String,
        status: TaskStatus,
    },
    HandoffReceived {
        timestamp: DateTime<Utc>,
        task_id: String,
        status: HandoffStatus,
        files_changed: usize,
        tokens_used: u64,
    },
    WorkerTimeout {
        timestamp: DateTime<Utc>,
        task_id: String,
        branch: String,
        timeout_secs: u64,
    },
    MergeResult {
        timestamp: DateTime<Utc>,
        branch: String,
        outcome: String,
        detail: String,
    },
    SweepCompleted {
        timestamp: DateTime<Utc>,
        build_ok: bool,
        tests_ok: bool,
        has_conflict_markers: bool,
        fix_tasks: usize,
    },
    PlannerIteration {
        timestamp: DateTime<Utc>,
        iteration: u32,
        new_tasks: usize,
        active_tasks: usize,
    },
    Metrics {
        timestamp: DateTime<Utc>,
        snapshot: MetricsSnapshot,
    },
    FinalizationStarted {
        timestamp: DateTime<Utc>,
        unmerged_branches: usize,
    },
    FinalizationAttempt {
        timestamp: DateTime<Utc>,
        attempt: u32,
        passed: bool,
    },
    FinalizationCompleted {
        timestamp: DateTime<Utc>,
        passed: bool,
        attempts: u32,
    },
    RunCompleted {
        timestamp: DateTime<Utc>,
        snapshot: MetricsSnapshot,
    },
    Error {
        timestamp: DateTime<Utc>,
        component: String,
        message: String,
    },
}

impl RunEvent {
    pub fn error(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            timestamp: Utc::now(),
            component: component.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_serialization() {
        let event = RunEvent::TaskStatusChanged {
            timestamp: Utc::now(),
            task_id: "task-001".to_string(),
            status: TaskStatus::Running,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_status_changed");
        assert_eq!(json["task_id"], "task-001");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn test_event_roundtrip() {
        let event = RunEvent::error("merge-queue", "push failed");
        let line = serde_json::to_string(&event).unwrap();
        let back: RunEvent = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, RunEvent::Error { .. }));
    }
}
