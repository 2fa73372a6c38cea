mod sweep;

pub use sweep::{Reconciler, SweepResult};
