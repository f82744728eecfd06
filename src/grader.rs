use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    constants::{
        MAX_NOTABLE_VARIATIONS, MIN_VIABLE_SAMPLES, WEIGHT_DECISION, WEIGHT_EXACT_MATCH,
        WEIGHT_LENGTH, WEIGHT_SEMANTIC, WEIGHT_STRUCTURAL, WEIGHT_TOOL_USAGE,
    },
    error::EngineError,
    llm::ConsistencyJudge,
    model::{ConsistencyMetrics, Grade, GradeLetter, GradingMethod, SampleResult, normalize_text},
};

/// JSON keys that carry a response's decision, checked in order.
const DECISION_KEYS: &[&str] = &[
    "decision",
    "answer",
    "result",
    "verdict",
    "label",
    "classification",
    "category",
    "action",
];

/// Words kept from the first sentence when deriving a free-text decision.
const DECISION_WORDS: usize = 12;

/// Coefficient of variation in response length above which it is reported.
const LENGTH_VARIATION_NOTE: f64 = 0.25;

/// Scores the mutual consistency of a set of samples.
#[derive(Debug, Clone)]
pub struct ConsistencyGrader {
    min_viable: usize,
}

impl Default for ConsistencyGrader {
    fn default() -> Self {
        Self {
            min_viable: MIN_VIABLE_SAMPLES,
        }
    }
}

impl ConsistencyGrader {
    pub fn min_viable(&self) -> usize {
        self.min_viable
    }

    /// Grade `samples`, consulting `judge` for decision and meaning when one is configured.
    /// Without a judge every dimension is computed locally.
    pub async fn grade(
        &self,
        samples: &[SampleResult],
        original_response: &str,
        instructions: Option<&str>,
        judge: Option<&dyn ConsistencyJudge>,
        partial: bool,
    ) -> Result<Grade, EngineError> {
        self.ensure_viable(samples)?;

        let Some(judge) = judge else {
            return self.statistical_fallback(samples, original_response, partial);
        };

        let mut metrics = statistical_metrics(samples, original_response);
        let mut variations = local_variations(samples, &metrics);

        let responses: Vec<String> = samples.iter().map(|sample| sample.text.clone()).collect();
        let verdict = judge
            .judge(original_response, &responses, instructions)
            .await
            .map_err(|err| {
                warn!(error = %err, samples = samples.len(), "grader.judge_failed");
                EngineError::GraderUnavailable(err.to_string())
            })?;

        metrics.decision_consistency = verdict.decision_consistency.clamp(0.0, 1.0);
        metrics.semantic_equivalence = verdict.semantic_equivalence.clamp(0.0, 1.0);
        let mut notable = verdict.notable_variations;
        notable.append(&mut variations);

        Ok(build_grade(samples, metrics, notable, GradingMethod::Judged, partial))
    }

    /// Lower-confidence grade that needs no judge: exact matches, length spread and
    /// the number of distinct responses drive every dimension.
    pub fn statistical_fallback(
        &self,
        samples: &[SampleResult],
        original_response: &str,
        partial: bool,
    ) -> Result<Grade, EngineError> {
        self.ensure_viable(samples)?;
        let metrics = statistical_metrics(samples, original_response);
        let variations = local_variations(samples, &metrics);
        Ok(build_grade(
            samples,
            metrics,
            variations,
            GradingMethod::Statistical,
            partial,
        ))
    }

    fn ensure_viable(&self, samples: &[SampleResult]) -> Result<(), EngineError> {
        if samples.len() < self.min_viable {
            return Err(EngineError::InsufficientData {
                available: samples.len(),
                required:  self.min_viable,
            });
        }
        Ok(())
    }
}

/// Weighted 0-100 score for a set of metrics.
pub fn score(metrics: &ConsistencyMetrics) -> f64 {
    let weighted = WEIGHT_DECISION * metrics.decision_consistency
        + WEIGHT_SEMANTIC * metrics.semantic_equivalence
        + WEIGHT_STRUCTURAL * metrics.structural_consistency
        + WEIGHT_TOOL_USAGE * metrics.tool_usage_consistency
        + WEIGHT_EXACT_MATCH * metrics.exact_match_rate
        + WEIGHT_LENGTH * metrics.length_consistency;
    ((weighted * 100.0).clamp(0.0, 100.0) * 10.0).round() / 10.0
}

fn build_grade(
    samples: &[SampleResult],
    metrics: ConsistencyMetrics,
    mut notable_variations: Vec<String>,
    method: GradingMethod,
    partial: bool,
) -> Grade {
    let score = score(&metrics);
    let letter = GradeLetter::from_score(score);
    notable_variations.dedup();
    notable_variations.truncate(MAX_NOTABLE_VARIATIONS);

    info!(
        score,
        letter = %letter,
        method = ?method,
        samples = samples.len(),
        partial,
        "grade.produced"
    );

    Grade {
        letter,
        score,
        metrics,
        notable_variations,
        graded_at: Utc::now(),
        responses_used_for_grading: samples.iter().map(|sample| sample.slot).collect(),
        method,
        partial,
    }
}

fn statistical_metrics(samples: &[SampleResult], original_response: &str) -> ConsistencyMetrics {
    let texts: Vec<&str> = samples.iter().map(|sample| sample.text.trim()).collect();

    let exact = tally(texts.iter().map(|text| text.to_string()));
    let decisions = tally(samples.iter().map(extract_decision));
    let structures = tally(texts.iter().map(|text| structure_signature(text)));
    let tools = tally(samples.iter().map(|sample| sample.tool_usage.signature()));

    let tool_counts: Vec<f64> = samples
        .iter()
        .map(|sample| sample.tool_usage.attempted as f64)
        .collect();
    let lengths: Vec<f64> = texts.iter().map(|text| text.chars().count() as f64).collect();
    let (length_mean, length_std_dev) = mean_and_std_dev(&lengths);
    let length_cv = if length_mean > 0.0 {
        length_std_dev / length_mean
    } else {
        0.0
    };

    ConsistencyMetrics {
        decision_consistency:    decisions.modal_share(),
        structural_consistency:  structures.modal_share(),
        semantic_equivalence:    mean_pairwise_similarity(&texts),
        exact_match_rate:        exact.modal_share(),
        tool_usage_consistency:  tools.modal_share(),
        tool_call_count_std_dev: mean_and_std_dev(&tool_counts).1,
        response_length_std_dev: length_std_dev,
        length_consistency:      (1.0 - length_cv).clamp(0.0, 1.0),
        unique_responses:        exact.distinct(),
        matches_original:        texts
            .iter()
            .filter(|text| **text == original_response.trim())
            .count(),
    }
}

fn local_variations(samples: &[SampleResult], metrics: &ConsistencyMetrics) -> Vec<String> {
    let mut notes = Vec::new();
    let total = samples.len();

    if metrics.unique_responses > 1 {
        notes.push(format!(
            "{} distinct responses across {} samples",
            metrics.unique_responses, total
        ));
    }

    let decisions = tally(samples.iter().map(extract_decision));
    if decisions.distinct() > 1 {
        let listed: Vec<String> = decisions
            .ranked()
            .into_iter()
            .take(3)
            .map(|(decision, count)| format!("'{decision}' ({count})"))
            .collect();
        notes.push(format!("decisions diverged: {}", listed.join(", ")));
    }

    if metrics.structural_consistency < 1.0 {
        notes.push("response format differed between samples".to_string());
    }

    if metrics.tool_usage_consistency < 1.0 {
        notes.push(format!(
            "tool usage differed between samples (call count std dev {:.2})",
            metrics.tool_call_count_std_dev
        ));
    }

    let invalid_calls: usize = samples
        .iter()
        .map(|sample| {
            sample
                .tool_usage
                .attempted
                .saturating_sub(sample.tool_usage.executed)
        })
        .sum();
    if invalid_calls > 0 {
        notes.push(format!("{invalid_calls} tool calls failed parameter validation"));
    }

    if 1.0 - metrics.length_consistency > LENGTH_VARIATION_NOTE {
        notes.push(format!(
            "response length varied (std dev {:.0} characters)",
            metrics.response_length_std_dev
        ));
    }

    if metrics.matches_original == 0 {
        notes.push("no sample reproduced the original response exactly".to_string());
    }

    notes
}

/// The branch a response took: its tool choice, a decision field, or its opening sentence.
fn extract_decision(sample: &SampleResult) -> String {
    if !sample.tool_usage.calls.is_empty() {
        let names: BTreeSet<&str> = sample
            .tool_usage
            .calls
            .iter()
            .map(|call| call.name.as_str())
            .collect();
        return format!("tools:{}", names.into_iter().collect::<Vec<_>>().join(","));
    }

    let trimmed = sample.text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        for key in DECISION_KEYS {
            let found = map
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
                .map(|(_, value)| value);
            if let Some(value) = found {
                return match value {
                    Value::String(text) => normalize_text(text),
                    other => other.to_string(),
                };
            }
        }
        let keys: BTreeSet<&str> = map.keys().map(String::as_str).collect();
        return format!("json:{}", keys.into_iter().collect::<Vec<_>>().join(","));
    }

    let normalized = normalize_text(trimmed);
    let first_sentence = normalized
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .find(|segment| !segment.is_empty())
        .unwrap_or_default();
    first_sentence
        .split_whitespace()
        .take(DECISION_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shape of a response independent of its wording.
fn structure_signature(text: &str) -> String {
    if text.is_empty() {
        return "empty".to_string();
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => {
            let keys: BTreeSet<&str> = map.keys().map(String::as_str).collect();
            return format!(
                "json_object:{}",
                keys.into_iter().collect::<Vec<_>>().join(",")
            );
        }
        Ok(Value::Array(_)) => return "json_array".to_string(),
        Ok(_) => return "json_scalar".to_string(),
        Err(_) => {}
    }

    let paragraphs = text
        .split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .count();
    let paragraph_bucket = match paragraphs {
        0 | 1 => "p1",
        2 | 3 => "p2-3",
        _ => "p4+",
    };
    let has_list = text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("- ")
            || line.starts_with("* ")
            || line
                .split_once(". ")
                .is_some_and(|(prefix, _)| !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()))
    });
    let has_code = text.contains("```");
    let has_heading = text.lines().any(|line| line.trim_start().starts_with('#'));

    format!(
        "text|{paragraph_bucket}|list={has_list}|code={has_code}|heading={has_heading}"
    )
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Mean Jaccard similarity of word sets over every pair of responses.
fn mean_pairwise_similarity(texts: &[&str]) -> f64 {
    let sets: Vec<BTreeSet<String>> = texts.iter().map(|text| tokens(text)).collect();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, left) in sets.iter().enumerate() {
        for right in &sets[i + 1..] {
            let union = left.union(right).count();
            let similarity = if union == 0 {
                1.0
            } else {
                left.intersection(right).count() as f64 / union as f64
            };
            total += similarity;
            pairs += 1;
        }
    }
    if pairs == 0 { 1.0 } else { total / pairs as f64 }
}

fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

struct Tally {
    counts: HashMap<String, usize>,
    total:  usize,
}

fn tally(items: impl Iterator<Item = String>) -> Tally {
    let mut counts = HashMap::new();
    let mut total = 0;
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
        total += 1;
    }
    Tally { counts, total }
}

impl Tally {
    /// Fraction of items equal to the most common one.
    fn modal_share(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let top = self.counts.values().copied().max().unwrap_or(0);
        top as f64 / self.total as f64
    }

    fn distinct(&self) -> usize {
        self.counts.len()
    }

    fn ranked(&self) -> Vec<(String, usize)> {
        let mut ranked: Vec<(String, usize)> = self
            .counts
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}
