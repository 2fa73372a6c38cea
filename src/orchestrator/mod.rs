mod engine;
mod events;
mod finalization;

pub use engine::Orchestrator;
pub use events::OrchestratorEvents;
pub use finalization::{FinalizationOutcome, FinalizationState};
