mod queue;

pub use queue::{ConflictInfo, MergeOutcome, MergeQueue, MergeResult, MergeStats};
