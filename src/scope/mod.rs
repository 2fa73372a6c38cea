mod tracker;

pub use tracker::{ScopeOverlap, ScopeTracker};
