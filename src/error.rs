use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArmadaError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskAlreadyExists(String),

    #[error("Invalid task transition: {task_id} {from} -> {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Retry budget exhausted for task {task_id} ({retries}/{max})")]
    RetryBudgetExhausted {
        task_id: String,
        retries: u32,
        max: u32,
    },

    #[error("Git error: {0}")]
    Git(String),

    #[error("Merge conflict on {branch}: {files:?}")]
    MergeConflict { branch: String, files: Vec<String> },

    #[error("Dispatch failed for task {task_id}: {message}")]
    Dispatch { task_id: String, message: String },

    #[error("Worker timed out after {timeout_secs}s: {task_id}")]
    WorkerTimeout { task_id: String, timeout_secs: u64 },

    #[error("Invalid handoff from task {task_id}: {message}")]
    InvalidHandoff { task_id: String, message: String },

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Reconciler sweep failed: {0}")]
    Sweep(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event log error: {0}")]
    EventLog(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ArmadaError>;

impl ArmadaError {
    /// True for failures the planner's auto-retry should reconsider rather
    /// than abort the run over.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Dispatch { .. }
                | Self::WorkerTimeout { .. }
                | Self::InvalidHandoff { .. }
                | Self::MergeConflict { .. }
                | Self::Llm(_)
                | Self::LlmParse(_)
                | Self::Sweep(_)
                | Self::Timeout(_)
        )
    }
}
