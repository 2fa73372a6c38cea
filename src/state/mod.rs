mod events;
mod log;

pub use events::RunEvent;
pub use log::EventLog;
