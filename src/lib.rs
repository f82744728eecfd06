//! Repeats one model request many times under throttling and retries, then grades how
//! consistent the responses are.

pub mod bus;
pub mod config;
pub mod constants;
pub mod controller;
pub mod degradation;
pub mod error;
pub mod executor;
pub mod export;
pub mod grader;
pub mod health;
pub mod llm;
pub mod model;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use bus::{StatusSnapshot, Subscription};
pub use config::{
    ConfigError, EngineConfig, EvaluationConfig, EvaluationSettings, ModelRequest, ToolDefinition,
};
pub use controller::{EvaluationController, EvaluationEngine};
pub use degradation::{DegradationPlan, FallbackKind, FallbackOption};
pub use error::{EngineError, ErrorClass, RecoveryAction, SurfacedError};
pub use export::EvaluationExport;
pub use health::{Health, HealthMonitor, HealthStatus, HealthThresholds, PartialQuality};
pub use llm::{ConsistencyJudge, ModelClient, ModelResponse, OpenAiJudge, OpenAiModelClient};
pub use model::{
    ConsistencyMetrics, EvaluationId, Grade, GradeLetter, GradingMethod, Phase, SampleResult,
    ThrottleStats,
};
pub use scheduler::BackoffPolicy;
