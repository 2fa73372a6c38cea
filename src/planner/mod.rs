mod parse;
mod planner;
mod subplanner;

pub use parse::{PlannedTask, extract_scratchpad, parse_task_array};
pub use planner::{Planner, PlannerDeps};
pub use subplanner::Subplanner;
