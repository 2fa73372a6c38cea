use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::slugify;

/// Longest slug suffix appended to a branch name.
const BRANCH_SLUG_MAX: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Transitions allowed by the task state machine. `Failed -> Pending`
    /// is the explicit retry edge.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Assigned)
                | (Self::Assigned, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Blocked)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work assigned to a single sandbox worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,

    /// Prose acceptance criterion the worker is judged against.
    #[serde(default)]
    pub acceptance: String,

    /// Repo-relative files this task claims.
    #[serde(default)]
    pub scope: Vec<String>,

    /// Branch the worker commits to, derived from id + description.
    pub branch: String,

    /// Lower is sooner. Fix tasks run at priority 1.
    #[serde(default = "default_priority")]
    pub priority: i32,

    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub retry_count: u32,

    /// Informational tag recorded at assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Set on subtasks produced by decomposition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Set on conflict-fix tasks: the branch whose merge conflicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_source: Option<String>,
}

fn default_priority() -> i32 {
    5
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, prefix: &str) -> Self {
        let id = id.into();
        let description = description.into();
        let branch = Self::branch_name(prefix, &id, &description);
        Self {
            id,
            description,
            acceptance: String::new(),
            scope: Vec::new(),
            branch,
            priority: default_priority(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            retry_count: 0,
            assignee: None,
            parent_id: None,
            conflict_source: None,
        }
    }

    /// `<prefix><id>-<slug>` with the slug capped at 50 chars.
    pub fn branch_name(prefix: &str, id: &str, description: &str) -> String {
        let slug = slugify(description, BRANCH_SLUG_MAX);
        if slug.is_empty() {
            format!("{}{}", prefix, id)
        } else {
            format!("{}{}-{}", prefix, id, slug)
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_acceptance(mut self, acceptance: impl Into<String>) -> Self {
        self.acceptance = acceptance.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_conflict_source(mut self, branch: impl Into<String>) -> Self {
        self.conflict_source = Some(branch.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Complete,
    Partial,
    Failed,
    Blocked,
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// The sandbox runner's report for one task. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub task_id: String,
    pub status: HandoffStatus,
    pub summary: String,
    pub diff: String,
    pub files_changed: Vec<String>,
    pub concerns: Vec<String>,
    pub suggestions: Vec<String>,
    pub metrics: HandoffMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_used: u64,
    pub tool_call_count: u64,
    pub duration_ms: u64,
}

impl Handoff {
    /// Synthetic failure record used when the worker never produced one.
    pub fn failure(task_id: impl Into<String>, summary: impl Into<String>) -> Self {
        let summary = summary.into();
        Self {
            task_id: task_id.into(),
            status: HandoffStatus::Failed,
            summary: summary.clone(),
            diff: String::new(),
            files_changed: Vec::new(),
            concerns: vec![summary],
            suggestions: vec!["Retry the task".to_string()],
            metrics: HandoffMetrics::default(),
        }
    }

    pub fn is_empty_diff(&self) -> bool {
        self.files_changed.is_empty()
    }

    /// A completed worker that used no tokens and made no tool calls did no
    /// observable work; surfaced to the suspicious-task observer.
    pub fn is_suspicious(&self) -> bool {
        self.metrics.tokens_used == 0 && self.metrics.tool_call_count == 0
    }
}
