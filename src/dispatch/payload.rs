use serde::{Deserialize, Serialize};

use crate::config::{GitConfig, LlmConfig};
use crate::queue::Task;

/// LLM parameters handed to the sandbox; the endpoint must already
/// terminate in `/v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmEndpoint {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_key: String,
}

impl From<&LlmConfig> for LlmEndpoint {
    fn from(config: &LlmConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            api_key: config.api_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: String,
}

impl TraceContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            parent_span_id: String::new(),
        }
    }
}

/// Everything an ephemeral sandbox needs to execute one task: written to the
/// runner's stdin as a single JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub task: Task,
    pub system_prompt: String,
    pub repo_url: String,
    pub git_token: String,
    pub llm_config: LlmEndpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl WorkerPayload {
    pub fn new(
        task: Task,
        system_prompt: impl Into<String>,
        git: &GitConfig,
        llm: &LlmConfig,
    ) -> Self {
        Self {
            task,
            system_prompt: system_prompt.into(),
            repo_url: git.repo_url.clone(),
            git_token: git.token(),
            llm_config: LlmEndpoint::from(llm),
            trace: Some(TraceContext::new_root()),
        }
    }
}
