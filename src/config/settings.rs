use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ArmadaError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmadaConfig {
    pub orchestrator: OrchestratorConfig,
    pub dispatch: DispatchConfig,
    pub merge: MergeConfig,
    pub reconciler: ReconcilerConfig,
    pub planner: PlannerConfig,
    pub finalization: FinalizationConfig,
    pub monitor: MonitorConfig,
    pub llm: LlmConfig,
    pub git: GitConfig,
    pub runner: RunnerConfig,

    /// Working copy of the target repository.
    pub target_repo_path: PathBuf,

    /// Structured event log destination (one JSON object per line).
    pub log_path: PathBuf,
}

impl ArmadaConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ArmadaError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.dispatch.max_workers == 0 {
            errors.push("dispatch.max_workers must be greater than 0");
        }
        if self.dispatch.worker_timeout_secs == 0 {
            errors.push("dispatch.worker_timeout_secs must be greater than 0");
        }

        if self.merge.tick_interval_ms == 0 {
            errors.push("merge.tick_interval_ms must be greater than 0");
        }

        if self.reconciler.interval_ms == 0 {
            errors.push("reconciler.interval_ms must be greater than 0");
        }
        if self.reconciler.min_interval_ms > self.reconciler.interval_ms {
            errors.push("reconciler.min_interval_ms must not exceed reconciler.interval_ms");
        }
        if self.reconciler.max_fix_tasks == 0 {
            errors.push("reconciler.max_fix_tasks must be greater than 0");
        }

        if self.planner.max_iterations == 0 {
            errors.push("planner.max_iterations must be greater than 0");
        }
        if self.planner.max_consecutive_errors == 0 {
            errors.push("planner.max_consecutive_errors must be greater than 0");
        }
        if self.planner.max_subtasks == 0 {
            errors.push("planner.max_subtasks must be greater than 0");
        }

        if self.finalization.max_attempts == 0 {
            errors.push("finalization.max_attempts must be greater than 0");
        }

        if self.llm.model.is_empty() {
            errors.push("llm.model must not be empty");
        }
        if self.llm.timeout_ms == 0 {
            errors.push("llm.timeout_ms must be greater than 0");
        }

        if self.git.main_branch.is_empty() {
            errors.push("git.main_branch must not be empty");
        }
        if self.git.branch_prefix.is_empty() {
            errors.push("git.branch_prefix must not be empty");
        }

        if self.runner.command.is_empty() {
            errors.push("runner.command must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArmadaError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Global budget of conflict-fix tasks injected per run. Interacts with
    /// merge.max_conflict_retries (attempts consumed before a conflict even
    /// reaches injection) and reconciler.max_fix_tasks (per-sweep cap on the
    /// other fix-task source); the three are not reconciled automatically,
    /// so raising one without the others shifts load rather than capacity.
    pub max_conflict_fix_tasks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_conflict_fix_tasks: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Semaphore capacity for concurrent sandbox workers.
    pub max_workers: usize,
    /// Hard wall-clock limit per dispatched task.
    pub worker_timeout_secs: u64,
    /// Maximum retries a task gets before staying failed.
    pub max_task_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            worker_timeout_secs: 1800,
            max_task_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    FastForward,
    #[default]
    Rebase,
    MergeCommit,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FastForward => write!(f, "fast-forward"),
            Self::Rebase => write!(f, "rebase"),
            Self::MergeCommit => write!(f, "merge-commit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
    /// Conflict retries per branch before the conflict callback fires.
    /// See OrchestratorConfig::max_conflict_fix_tasks for the interaction
    /// with the downstream fix-task budgets.
    pub max_conflict_retries: u32,
    /// Pause between background drain cycles.
    pub tick_interval_ms: u64,
    /// Prefix for out-of-line rebase scratch branches.
    pub temp_branch_prefix: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Rebase,
            max_conflict_retries: 2,
            tick_interval_ms: 5000,
            temp_branch_prefix: "armada-rebase/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Sweep interval ceiling; restored after three consecutive green sweeps.
    pub interval_ms: u64,
    /// Sweep interval floor used while checks are failing. The effective
    /// floor is min(60s, this value).
    pub min_interval_ms: u64,
    /// Cap on fix tasks emitted per sweep. See
    /// OrchestratorConfig::max_conflict_fix_tasks for budget interaction.
    pub max_fix_tasks: usize,
    /// Typed build check, e.g. "npx tsc --noEmit". Empty = skipped.
    pub build_check_command: String,
    /// Project build command. Empty = skipped.
    pub build_command: String,
    /// Project test command. Empty = skipped.
    pub test_command: String,
    /// LLM call timeout for fix-task generation.
    pub llm_timeout_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
            min_interval_ms: 60_000,
            max_fix_tasks: 5,
            build_check_command: String::new(),
            build_command: String::new(),
            test_command: String::new(),
            llm_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_iterations: u32,
    /// Handoffs that must accumulate before a re-plan while work is active.
    pub min_handoffs_for_replan: usize,
    /// Consecutive planning failures tolerated before the loop aborts.
    pub max_consecutive_errors: u32,
    /// Scope size at which a task is routed through the subplanner.
    pub decompose_scope_threshold: usize,
    /// Maximum subplanner recursion depth.
    pub max_decompose_depth: u32,
    /// Maximum children per decomposition.
    pub max_subtasks: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            min_handoffs_for_replan: 3,
            max_consecutive_errors: 10,
            decompose_scope_threshold: 8,
            max_decompose_depth: 3,
            max_subtasks: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Per-attempt budget for waiting on injected fix tasks.
    pub sweep_timeout_ms: u64,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            sweep_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Metrics snapshot emission period.
    pub health_check_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint, must already terminate in /v1.
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_ms: u64,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "glm-5".to_string(),
            max_tokens: 8192,
            temperature: 0.2,
            timeout_ms: 300_000,
            api_key_env: "ARMADA_LLM_API_KEY".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> String {
        std::env::var(&self.api_key_env).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Remote URL workers clone from and the merge queue pushes to.
    pub repo_url: String,
    pub main_branch: String,
    pub branch_prefix: String,
    /// Environment variable holding the git token handed to workers.
    pub token_env: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            main_branch: "main".to_string(),
            branch_prefix: "worker/".to_string(),
            token_env: "ARMADA_GIT_TOKEN".to_string(),
        }
    }
}

impl GitConfig {
    pub fn token(&self) -> String {
        std::env::var(&self.token_env).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Sandbox runner executable. Receives the worker payload as JSON on
    /// stdin and must print the handoff as its last stdout line.
    pub command: String,
    pub args: Vec<String>,
    /// System prompt handed to every worker.
    pub system_prompt: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: "armada-sandbox".to_string(),
            args: Vec::new(),
            system_prompt: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ArmadaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = ArmadaConfig::default();
        config.dispatch.max_workers = 0;
        config.llm.model = String::new();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_workers"));
        assert!(err.contains("llm.model"));
    }

    #[test]
    fn test_min_interval_must_not_exceed_ceiling() {
        let mut config = ArmadaConfig::default();
        config.reconciler.min_interval_ms = config.reconciler.interval_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_strategy_roundtrip() {
        let toml = "strategy = \"fast-forward\"";
        let merge: MergeConfig = toml::from_str(toml).unwrap();
        assert_eq!(merge.strategy, MergeStrategy::FastForward);
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArmadaConfig::load(&dir.path().join("config.toml"))
            .await
            .unwrap();
        assert_eq!(config.dispatch.max_workers, 50);
        assert_eq!(config.git.main_branch, "main");
    }
}
