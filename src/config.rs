use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    constants::{
        DEFAULT_ATTEMPT_TIMEOUT_MS, DEFAULT_CONCURRENCY_WINDOW,
        DEFAULT_CONNECTIVITY_FAILURE_THRESHOLD, DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_TEST_COUNT,
        MAX_RETRY_ATTEMPTS_LIMIT, MAX_TEST_COUNT, MIN_TEST_COUNT,
    },
    health::HealthThresholds,
    scheduler::BackoffPolicy,
};

/// Errors raised while validating or loading configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sample count {requested} is outside {min}..={max}")]
    SampleCountOutOfRange {
        requested: usize,
        min:       usize,
        max:       usize,
    },
    #[error("max retry attempts {requested} exceeds the limit of {max}")]
    RetryLimitExceeded { requested: u32, max: u32 },
    #[error("model id must not be empty")]
    MissingModel,
    #[error("user prompt must not be empty")]
    EmptyPrompt,
    #[error("test id must not be empty")]
    MissingTestId,
    #[error("concurrency window must be at least 1")]
    ZeroConcurrency,
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: String, value: String },
}

/// Tool/function made available to the model on each invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name:        String,
    pub description: Option<String>,
    /// JSON schema of the tool's parameters.
    pub parameters:  Value,
}

impl ToolDefinition {
    /// Names listed under the schema's `required` key.
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// The reference invocation an evaluation repeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRequest {
    pub model_id:        String,
    pub system_prompt:   Option<String>,
    pub user_prompt:     String,
    pub dataset_content: Option<String>,
    pub tools:           Vec<ToolDefinition>,
}

impl ModelRequest {
    pub fn new(model_id: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model_id:        model_id.into(),
            system_prompt:   None,
            user_prompt:     user_prompt.into(),
            dataset_content: None,
            tools:           Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_dataset(mut self, content: impl Into<String>) -> Self {
        self.dataset_content = Some(content.into());
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

/// Persisted user preferences handed to the engine at start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationSettings {
    pub test_count:               usize,
    pub max_retry_attempts:       u32,
    pub enable_throttling_alerts: bool,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            test_count:               DEFAULT_TEST_COUNT,
            max_retry_attempts:       DEFAULT_MAX_RETRY_ATTEMPTS,
            enable_throttling_alerts: true,
        }
    }
}

/// Immutable description of one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationConfig {
    /// Logical test the evaluation belongs to; at most one active run per test id.
    pub test_id:                String,
    pub request:                ModelRequest,
    /// The model response that triggered the evaluation. Never discarded.
    pub original_response:      String,
    pub target_sample_count:    usize,
    /// Retries allowed per sample after its first attempt.
    pub max_retry_attempts:     u32,
    pub enable_throttle_alerts: bool,
    pub grader_instructions:    Option<String>,
}

impl EvaluationConfig {
    pub fn new(
        test_id: impl Into<String>,
        request: ModelRequest,
        original_response: impl Into<String>,
    ) -> Self {
        Self::from_settings(test_id, request, original_response, &EvaluationSettings::default())
    }

    /// Build a config from the settings provider's current values.
    pub fn from_settings(
        test_id: impl Into<String>,
        request: ModelRequest,
        original_response: impl Into<String>,
        settings: &EvaluationSettings,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            request,
            original_response: original_response.into(),
            target_sample_count: settings.test_count,
            max_retry_attempts: settings.max_retry_attempts,
            enable_throttle_alerts: settings.enable_throttling_alerts,
            grader_instructions: None,
        }
    }

    pub fn with_grader_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.grader_instructions = Some(instructions.into());
        self
    }

    /// Same reference request with a different sample and retry budget.
    pub fn with_budget(&self, settings: &EvaluationSettings) -> Self {
        Self {
            target_sample_count: settings.test_count,
            max_retry_attempts: settings.max_retry_attempts,
            enable_throttle_alerts: settings.enable_throttling_alerts,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_id.trim().is_empty() {
            return Err(ConfigError::MissingTestId);
        }
        if !(MIN_TEST_COUNT..=MAX_TEST_COUNT).contains(&self.target_sample_count) {
            return Err(ConfigError::SampleCountOutOfRange {
                requested: self.target_sample_count,
                min:       MIN_TEST_COUNT,
                max:       MAX_TEST_COUNT,
            });
        }
        if self.max_retry_attempts > MAX_RETRY_ATTEMPTS_LIMIT {
            return Err(ConfigError::RetryLimitExceeded {
                requested: self.max_retry_attempts,
                max:       MAX_RETRY_ATTEMPTS_LIMIT,
            });
        }
        if self.request.model_id.trim().is_empty() {
            return Err(ConfigError::MissingModel);
        }
        if self.request.user_prompt.trim().is_empty() {
            return Err(ConfigError::EmptyPrompt);
        }
        Ok(())
    }
}

/// Process-wide tunables shared by every evaluation a controller runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Attempts allowed in flight per evaluation.
    pub concurrency_window:             usize,
    pub attempt_timeout:                Duration,
    pub backoff:                        BackoffPolicy,
    pub health:                         HealthThresholds,
    pub connectivity_failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_window:             DEFAULT_CONCURRENCY_WINDOW,
            attempt_timeout:                Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            backoff:                        BackoffPolicy::default(),
            health:                         HealthThresholds::default(),
            connectivity_failure_threshold: DEFAULT_CONNECTIVITY_FAILURE_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `DETERMINISM_*` environment variables when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(window) = env_value::<usize>("DETERMINISM_CONCURRENCY")? {
            config.concurrency_window = window;
        }
        if let Some(ms) = env_value::<u64>("DETERMINISM_ATTEMPT_TIMEOUT_MS")? {
            config.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("DETERMINISM_BACKOFF_BASE_MS")? {
            config.backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("DETERMINISM_BACKOFF_MAX_MS")? {
            config.backoff.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_value::<u64>("DETERMINISM_STALL_WINDOW_SECS")? {
            config.health.stall_window = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_window == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            name:  name.to_string(),
            value: raw,
        })
}
