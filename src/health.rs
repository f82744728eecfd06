use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        DEFAULT_CRITICAL_ERROR_RATE, DEFAULT_CRITICAL_THROTTLE_RATE,
        DEFAULT_MIN_ATTEMPTS_FOR_RATES, DEFAULT_SLOW_WINDOW_SECS, DEFAULT_STALL_WINDOW_SECS,
        GOOD_PARTIAL_SAMPLES, MIN_VIABLE_SAMPLES,
    },
    model::{AttemptStats, Phase},
};

/// Limits at which an evaluation's health escalates.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub stall_window:           Duration,
    pub slow_window:            Duration,
    pub critical_error_rate:    f64,
    pub critical_throttle_rate: f64,
    pub min_attempts_for_rates: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stall_window:           Duration::from_secs(DEFAULT_STALL_WINDOW_SECS),
            slow_window:            Duration::from_secs(DEFAULT_SLOW_WINDOW_SECS),
            critical_error_rate:    DEFAULT_CRITICAL_ERROR_RATE,
            critical_throttle_rate: DEFAULT_CRITICAL_THROTTLE_RATE,
            min_attempts_for_rates: DEFAULT_MIN_ATTEMPTS_FOR_RATES,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// How trustworthy a grade over the samples collected so far would be.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartialQuality {
    Good,
    Fair,
    Limited,
}

impl PartialQuality {
    pub fn for_samples(completed: usize) -> Self {
        if completed >= GOOD_PARTIAL_SAMPLES {
            PartialQuality::Good
        } else if completed >= MIN_VIABLE_SAMPLES {
            PartialQuality::Fair
        } else {
            PartialQuality::Limited
        }
    }
}

impl fmt::Display for PartialQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartialQuality::Good => "good",
            PartialQuality::Fair => "fair",
            PartialQuality::Limited => "limited",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub status:                    HealthStatus,
    pub issues:                    Vec<String>,
    pub recommendations:           Vec<String>,
    pub can_continue_with_partial: bool,
    pub partial_quality:           PartialQuality,
}

/// Progress figures the monitor judges health from.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSnapshot {
    pub phase:               Phase,
    pub completed:           usize,
    pub target:              usize,
    pub abandoned:           usize,
    pub attempts:            AttemptStats,
    pub elapsed:             Duration,
    pub since_last_progress: Duration,
    pub connectivity_lost:   bool,
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn assess(&self, snapshot: &EvaluationSnapshot) -> Health {
        let partial_quality = PartialQuality::for_samples(snapshot.completed);
        let can_continue_with_partial = snapshot.completed >= MIN_VIABLE_SAMPLES;
        let running = matches!(
            snapshot.phase,
            Phase::Collecting | Phase::Throttled | Phase::Evaluating
        );

        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();
        let mut advice = Vec::new();

        if running && snapshot.since_last_progress >= self.thresholds.stall_window {
            status = status.max(HealthStatus::Warning);
            issues.push(format!(
                "no progress for {}s",
                snapshot.since_last_progress.as_secs()
            ));
            advice.push("Wait for in-flight requests to finish or cancel and retry".to_string());
        }

        if running
            && snapshot.elapsed >= self.thresholds.slow_window
            && snapshot.completed * 2 < snapshot.target
        {
            status = status.max(HealthStatus::Warning);
            issues.push(format!(
                "{} of {} samples after {}s",
                snapshot.completed,
                snapshot.target,
                snapshot.elapsed.as_secs()
            ));
            advice.push("Retry with fewer samples".to_string());
        }

        if snapshot.attempts.total >= self.thresholds.min_attempts_for_rates {
            let error_rate = snapshot.attempts.error_rate();
            if error_rate > self.thresholds.critical_error_rate {
                status = HealthStatus::Critical;
                issues.push(format!("{:.0}% of attempts failed", error_rate * 100.0));
                advice.push("Check the model backend status before retrying".to_string());
            }

            let throttle_rate = snapshot.attempts.throttle_rate();
            if throttle_rate > self.thresholds.critical_throttle_rate {
                status = HealthStatus::Critical;
                issues.push(format!("{:.0}% of attempts were throttled", throttle_rate * 100.0));
                advice.push("Wait for the rate limit to reset and retry with fewer samples".to_string());
            }
        }

        if snapshot.connectivity_lost {
            status = HealthStatus::Critical;
            issues.push("connectivity to the model backend was lost".to_string());
            advice.push("Check network connectivity, then resume".to_string());
        }

        let mut recommendations = Vec::new();
        if status != HealthStatus::Healthy && can_continue_with_partial {
            recommendations.push(format!(
                "Continue with partial data ({} samples, {} quality)",
                snapshot.completed, partial_quality
            ));
        }
        for item in advice {
            if !recommendations.contains(&item) {
                recommendations.push(item);
            }
        }

        Health {
            status,
            issues,
            recommendations,
            can_continue_with_partial,
            partial_quality,
        }
    }
}
