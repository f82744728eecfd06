use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque identity of one evaluation run.
pub type EvaluationId = Uuid;

/// Lifecycle phase of an evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Collecting,
    Throttled,
    Paused,
    Evaluating,
    Completed,
    Error,
}

impl Phase {
    /// Phases in which the evaluation is still doing or waiting on work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Phase::Collecting | Phase::Throttled | Phase::Paused | Phase::Evaluating
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Collecting => "collecting",
            Phase::Throttled => "throttled",
            Phase::Paused => "paused",
            Phase::Evaluating => "evaluating",
            Phase::Completed => "completed",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting reported by the model client.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens:     u32,
    pub completion_tokens: u32,
    pub total_tokens:      u32,
}

/// One tool/function call made by the model, with its validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name:             String,
    pub arguments:        Value,
    pub valid:            bool,
    pub validation_error: Option<String>,
}

impl ToolCallRecord {
    /// Sorted top-level parameter names, used to compare calls structurally.
    pub fn parameter_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match &self.arguments {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        keys.sort();
        keys
    }
}

/// Tool activity observed during a single sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolUsage {
    pub attempted: usize,
    pub executed:  usize,
    pub calls:     Vec<ToolCallRecord>,
}

impl ToolUsage {
    pub fn from_calls(calls: Vec<ToolCallRecord>) -> Self {
        let executed = calls.iter().filter(|call| call.valid).count();
        Self {
            attempted: calls.len(),
            executed,
            calls,
        }
    }

    /// Order-insensitive signature of tool names and parameter shapes.
    pub fn signature(&self) -> String {
        let mut parts: Vec<String> = self
            .calls
            .iter()
            .map(|call| format!("{}({})", call.name, call.parameter_keys().join(",")))
            .collect();
        parts.sort();
        parts.join(";")
    }
}

/// Result of one successfully completed sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleResult {
    /// Issuance slot the sample was collected for.
    pub slot:         usize,
    pub text:         String,
    pub token_usage:  Option<TokenUsage>,
    pub tool_usage:   ToolUsage,
    pub latency_ms:   u64,
    pub throttled:    bool,
    pub retries:      u32,
    pub completed_at: DateTime<Utc>,
}

/// Cumulative throttling counters for an evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThrottleStats {
    pub throttled_count: u32,
    pub abandoned_count: u32,
}

/// Counters over every attempt issued, successful or not.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptStats {
    pub total:     u32,
    pub succeeded: u32,
    pub throttled: u32,
    pub failed:    u32,
}

impl AttemptStats {
    pub fn error_rate(&self) -> f64 {
        ratio(self.failed, self.total)
    }

    pub fn throttle_rate(&self) -> f64 {
        ratio(self.throttled, self.total)
    }
}

fn ratio(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(whole)
    }
}

/// Letter summary of a consistency score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GradeLetter {
    A,
    B,
    C,
    D,
    F,
}

impl GradeLetter {
    /// Bands are inclusive at the lower edge: 90 is an A, 70 a B, 50 a C, 30 a D.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            GradeLetter::A
        } else if score >= 70.0 {
            GradeLetter::B
        } else if score >= 50.0 {
            GradeLetter::C
        } else if score >= 30.0 {
            GradeLetter::D
        } else {
            GradeLetter::F
        }
    }
}

impl fmt::Display for GradeLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            GradeLetter::A => "A",
            GradeLetter::B => "B",
            GradeLetter::C => "C",
            GradeLetter::D => "D",
            GradeLetter::F => "F",
        };
        f.write_str(letter)
    }
}

/// Per-dimension consistency measurements. Ratios are in `0.0..=1.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyMetrics {
    pub decision_consistency:    f64,
    pub structural_consistency:  f64,
    pub semantic_equivalence:    f64,
    pub exact_match_rate:        f64,
    pub tool_usage_consistency:  f64,
    pub tool_call_count_std_dev: f64,
    pub response_length_std_dev: f64,
    pub length_consistency:      f64,
    pub unique_responses:        usize,
    pub matches_original:        usize,
}

/// How a grade was produced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GradingMethod {
    /// Decision and semantic dimensions came from the judging model.
    Judged,
    /// Every dimension was computed locally; lower confidence.
    Statistical,
}

/// Immutable consistency grade for a set of samples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grade {
    pub letter:                     GradeLetter,
    pub score:                      f64,
    pub metrics:                    ConsistencyMetrics,
    pub notable_variations:         Vec<String>,
    pub graded_at:                  DateTime<Utc>,
    /// Slots of the samples that were graded.
    pub responses_used_for_grading: Vec<usize>,
    pub method:                     GradingMethod,
    pub partial:                    bool,
}

/// Normalizes text for comparison: trim, collapse whitespace, lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_text_lowercases_and_collapses_whitespace() {
        let input = "  Hello   World ";
        let normalized = normalize_text(input);
        assert_eq!(normalized, "hello world");
    }

    #[test]
    fn grade_letters_follow_bands() {
        assert_eq!(GradeLetter::from_score(95.0), GradeLetter::A);
        assert_eq!(GradeLetter::from_score(80.0), GradeLetter::B);
        assert_eq!(GradeLetter::from_score(60.0), GradeLetter::C);
        assert_eq!(GradeLetter::from_score(40.0), GradeLetter::D);
        assert_eq!(GradeLetter::from_score(10.0), GradeLetter::F);
    }

    #[test]
    fn grade_band_boundaries_belong_to_higher_band() {
        assert_eq!(GradeLetter::from_score(90.0), GradeLetter::A);
        assert_eq!(GradeLetter::from_score(70.0), GradeLetter::B);
        assert_eq!(GradeLetter::from_score(50.0), GradeLetter::C);
        assert_eq!(GradeLetter::from_score(30.0), GradeLetter::D);
        assert_eq!(GradeLetter::from_score(89.99), GradeLetter::B);
        assert_eq!(GradeLetter::from_score(29.99), GradeLetter::F);
    }

    #[test]
    fn tool_signature_ignores_call_order_and_values() {
        let call = |name: &str, args: Value| ToolCallRecord {
            name: name.to_string(),
            arguments: args,
            valid: true,
            validation_error: None,
        };
        let first = ToolUsage::from_calls(vec![
            call("lookup", json!({"id": 1, "scope": "a"})),
            call("notify", json!({"to": "x"})),
        ]);
        let second = ToolUsage::from_calls(vec![
            call("notify", json!({"to": "y"})),
            call("lookup", json!({"scope": "b", "id": 7})),
        ]);
        assert_eq!(first.signature(), second.signature());
        assert_eq!(first.executed, 2);
    }

    #[test]
    fn attempt_rates_handle_zero_attempts() {
        let stats = AttemptStats::default();
        assert_eq!(stats.error_rate(), 0.0);
        assert_eq!(stats.throttle_rate(), 0.0);
    }
}
