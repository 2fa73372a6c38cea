//! Scripted LLM client for driving planner and reconciler tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use armada::error::{ArmadaError, Result};
use armada::llm::{ChatMessage, Completion, LlmClient};

/// Replays a queue of scripted replies, then falls back to a default.
/// Records every prompt for assertions.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    default_reply: String,
    tokens_per_call: u64,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    /// Empty-task-array default: a planner that has nothing more to add.
    pub fn new() -> Self {
        Self::with_default("[]")
    }

    pub fn with_default(default_reply: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: default_reply.to_string(),
            tokens_per_call: 42,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().push_back(Ok(text.to_string()));
        self
    }

    pub fn error(self, message: &str) -> Self {
        self.replies.lock().push_back(Err(message.to_string()));
        self
    }

    /// Queue the same error n times.
    pub fn errors(self, message: &str, n: usize) -> Self {
        for _ in 0..n {
            self.replies.lock().push_back(Err(message.to_string()));
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(last) = messages.last() {
            self.prompts.lock().push(last.content.clone());
        }

        let next = self.replies.lock().pop_front();
        match next {
            Some(Ok(text)) => Ok(Completion {
                text,
                tokens_used: self.tokens_per_call,
            }),
            Some(Err(message)) => Err(ArmadaError::Llm(message)),
            None => Ok(Completion {
                text: self.default_reply.clone(),
                tokens_used: self.tokens_per_call,
            }),
        }
    }
}
