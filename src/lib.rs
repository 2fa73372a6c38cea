pub mod config;
pub mod dispatch;
pub mod error;
pub mod git;
pub mod llm;
pub mod merge;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod reconciler;
pub mod scope;
pub mod state;
pub mod utils;

pub use config::ArmadaConfig;
pub use dispatch::{ProcessSandboxRunner, SandboxRunner, WorkerDispatcher, WorkerPayload};
pub use error::{ArmadaError, Result};
pub use git::{GitMutex, GitRunner};
pub use llm::{ChatMessage, Completion, HttpLlmClient, LlmClient, LlmSession};
pub use merge::{MergeQueue, MergeResult};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorEvents};
pub use planner::Planner;
pub use queue::{Handoff, HandoffStatus, Task, TaskQueue, TaskStatus};
pub use reconciler::{Reconciler, SweepResult};
pub use scope::ScopeTracker;
pub use state::{EventLog, RunEvent};
