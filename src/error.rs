use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::ConfigError,
    constants::MIN_VIABLE_SAMPLES,
    model::{EvaluationId, Phase},
};

/// Errors surfaced by the evaluation engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("backend is throttling requests: {0}")]
    Throttle(String),
    #[error("network failure: {0}")]
    TransientNetwork(String),
    #[error("request rejected by backend: {0}")]
    Fatal(String),
    #[error("grader unavailable: {0}")]
    GraderUnavailable(String),
    #[error("insufficient data: {available} usable samples, at least {required} required")]
    InsufficientData { available: usize, required: usize },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("evaluation {0} not found")]
    NotFound(EvaluationId),
    #[error("cannot {operation} an evaluation that is {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase:     Phase,
    },
    #[error("failed to export evaluation: {0}")]
    Export(String),
    #[error("evaluation controller is not running")]
    ControllerUnavailable,
}

impl EngineError {
    /// Position of this error in the failure taxonomy, if it is a failure of the run itself.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            EngineError::Throttle(_) => Some(ErrorClass::Throttle),
            EngineError::TransientNetwork(_) => Some(ErrorClass::TransientNetwork),
            EngineError::Fatal(_) => Some(ErrorClass::Fatal),
            EngineError::GraderUnavailable(_) => Some(ErrorClass::GraderUnavailable),
            EngineError::InsufficientData { .. } => Some(ErrorClass::InsufficientData),
            _ => None,
        }
    }

    /// Rebuild an engine error from its user-facing form.
    pub fn from_surfaced(surfaced: &SurfacedError) -> Self {
        let message = surfaced.message.clone();
        match surfaced.class {
            ErrorClass::Throttle => EngineError::Throttle(message),
            ErrorClass::TransientNetwork => EngineError::TransientNetwork(message),
            ErrorClass::Fatal => EngineError::Fatal(message),
            ErrorClass::GraderUnavailable => EngineError::GraderUnavailable(message),
            ErrorClass::InsufficientData => EngineError::InsufficientData {
                available: surfaced.salvaged_samples,
                required:  MIN_VIABLE_SAMPLES,
            },
        }
    }
}

/// Failure taxonomy carried on surfaced errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Throttle,
    TransientNetwork,
    Fatal,
    GraderUnavailable,
    InsufficientData,
}

/// Recovery steps offered to the user after a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    WaitAndRetry,
    ContinueWithPartial,
    ReduceSampleCount,
    StatisticalFallback,
    Export,
    Cancel,
}

impl RecoveryAction {
    pub fn label(self) -> &'static str {
        match self {
            RecoveryAction::WaitAndRetry => "Wait and retry the evaluation",
            RecoveryAction::ContinueWithPartial => "Continue with the samples collected so far",
            RecoveryAction::ReduceSampleCount => "Retry with fewer samples",
            RecoveryAction::StatisticalFallback => "Grade with statistical analysis only",
            RecoveryAction::Export => "Export the collected samples",
            RecoveryAction::Cancel => "Cancel the evaluation",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// User-facing form of a failure: what happened, what was salvaged, what to do next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfacedError {
    pub class:            ErrorClass,
    pub message:          String,
    pub salvaged_samples: usize,
    /// Ranked, most useful first.
    pub actions:          Vec<RecoveryAction>,
}

impl fmt::Display for SurfacedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_failures_have_a_class() {
        assert_eq!(
            EngineError::Throttle("429".into()).class(),
            Some(ErrorClass::Throttle)
        );
        assert_eq!(
            EngineError::InsufficientData {
                available: 1,
                required:  3,
            }
            .class(),
            Some(ErrorClass::InsufficientData)
        );
        assert_eq!(EngineError::ControllerUnavailable.class(), None);
    }

    #[test]
    fn insufficient_data_message_names_counts() {
        let err = EngineError::InsufficientData {
            available: 2,
            required:  3,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data: 2 usable samples, at least 3 required"
        );
    }
}
