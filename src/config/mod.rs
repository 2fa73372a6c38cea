mod settings;

pub use settings::{
    ArmadaConfig, DispatchConfig, FinalizationConfig, GitConfig, LlmConfig, MergeConfig,
    MergeStrategy, MonitorConfig, OrchestratorConfig, PlannerConfig, ReconcilerConfig,
    RunnerConfig,
};
