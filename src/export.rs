use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::EvaluationConfig,
    error::{EngineError, SurfacedError},
    model::{
        AttemptStats, ConsistencyMetrics, EvaluationId, Grade, Phase, SampleResult, ThrottleStats,
    },
};

/// Portable record of one evaluation: its configuration, outcome and every collected sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationExport {
    pub evaluation_id:     EvaluationId,
    pub test_id:           String,
    pub phase:             Phase,
    pub config:            EvaluationConfig,
    pub grade:             Option<Grade>,
    pub metrics:           Option<ConsistencyMetrics>,
    /// In completion order.
    pub samples:           Vec<SampleResult>,
    pub throttle_stats:    ThrottleStats,
    pub attempt_stats:     AttemptStats,
    pub error:             Option<SurfacedError>,
    pub completion_reason: Option<String>,
    pub exported_at:       DateTime<Utc>,
}

impl EvaluationExport {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|err| EngineError::Export(err.to_string()))
    }
}
