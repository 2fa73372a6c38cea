//! Parsing of model planning responses: an optional scratchpad block and a
//! JSON task array, possibly wrapped in a fenced code block.

use serde::{Deserialize, Serialize};

use crate::error::{ArmadaError, Result};

/// A task as the model emits it, before ids and branches are assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub description: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub acceptance: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Extract the scratchpad block, if present. The planner rewrites (never
/// appends) its scratchpad each turn, so the last block wins.
pub fn extract_scratchpad(text: &str) -> Option<String> {
    let mut result = None;
    let mut rest = text;
    while let Some(start) = rest.find("<scratchpad>") {
        let after = &rest[start + "<scratchpad>".len()..];
        match after.find("</scratchpad>") {
            Some(end) => {
                result = Some(after[..end].trim().to_string());
                rest = &after[end + "</scratchpad>".len()..];
            }
            None => break,
        }
    }
    result
}

/// Parse the first JSON array found in the response. Accepts bare arrays,
/// ```json fences, and arrays embedded in prose.
pub fn parse_task_array(text: &str) -> Result<Vec<PlannedTask>> {
    let candidate = fenced_json(text).unwrap_or(text);

    if let Ok(tasks) = serde_json::from_str::<Vec<PlannedTask>>(candidate.trim()) {
        return Ok(tasks);
    }

    // Fall back to the outermost bracketed span.
    let start = candidate.find('[');
    let end = candidate.rfind(']');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            let span = &candidate[start..=end];
            return serde_json::from_str::<Vec<PlannedTask>>(span).map_err(|e| {
                ArmadaError::LlmParse(format!("task array did not parse: {}", e))
            });
        }
    }

    Err(ArmadaError::LlmParse(
        "response contained no task array".to_string(),
    ))
}

fn fenced_json(text: &str) -> Option<&str> {
    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let after = &text[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('[') {
                    return Some(inner);
                }
            }
        }
    }
    None
}
