mod runner;

pub use runner::{GitMutex, GitRunner, MergeAttempt};
