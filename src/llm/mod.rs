mod client;
mod session;

pub use client::{ChatMessage, Completion, HttpLlmClient, LlmClient};
pub use session::LlmSession;
