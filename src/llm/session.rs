use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::client::{ChatMessage, Completion, LlmClient};
use crate::error::{ArmadaError, Result};

/// Stateful conversation handle. The planner owns one for its long-running
/// session; subplanners create short-lived ones. History accumulates until
/// `close()`, after which `prompt` fails.
pub struct LlmSession {
    client: Arc<dyn LlmClient>,
    state: Mutex<SessionState>,
}

struct SessionState {
    messages: Vec<ChatMessage>,
    closed: bool,
}

impl LlmSession {
    pub fn new(client: Arc<dyn LlmClient>, system_prompt: Option<String>) -> Self {
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        Self {
            client,
            state: Mutex::new(SessionState {
                messages,
                closed: false,
            }),
        }
    }

    /// Send one user turn, record the assistant reply, return the completion.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<Completion> {
        let text = text.into();
        let messages = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ArmadaError::SessionClosed);
            }
            state.messages.push(ChatMessage::user(text));
            state.messages.clone()
        };

        let completion = self.client.complete(&messages).await;

        let mut state = self.state.lock().await;
        match completion {
            Ok(completion) => {
                state.messages.push(ChatMessage::assistant(&completion.text));
                Ok(completion)
            }
            Err(e) => {
                // Drop the unanswered user turn so a retry does not stack
                // duplicate prompts in history.
                state.messages.pop();
                Err(e)
            }
        }
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            debug!(turns = state.messages.len(), "LLM session closed");
            state.closed = true;
            state.messages.clear();
        }
    }

    pub async fn turn_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}
