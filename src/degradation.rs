use serde::{Deserialize, Serialize};

use crate::{
    constants::MIN_VIABLE_SAMPLES,
    error::{EngineError, ErrorClass, RecoveryAction, SurfacedError},
    health::{EvaluationSnapshot, PartialQuality},
};

/// What can still be salvaged after a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    OriginalPreserved,
    PartialAnalysis,
    StatisticalFallback,
    ManualExport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackOption {
    pub kind:   FallbackKind,
    pub impact: String,
}

/// Recovery plan built for an evaluation that failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DegradationPlan {
    pub original_result_preserved: bool,
    pub fallback_options:          Vec<FallbackOption>,
    pub recovery_actions:          Vec<RecoveryAction>,
    pub recommendations:           Vec<String>,
    pub error:                     SurfacedError,
}

impl DegradationPlan {
    pub fn offers(&self, kind: FallbackKind) -> bool {
        self.fallback_options.iter().any(|option| option.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub struct DegradationPlanner {
    min_viable: usize,
}

impl Default for DegradationPlanner {
    fn default() -> Self {
        Self {
            min_viable: MIN_VIABLE_SAMPLES,
        }
    }
}

impl DegradationPlanner {
    pub fn plan(&self, snapshot: &EvaluationSnapshot, error: &EngineError) -> DegradationPlan {
        let class = error.class().unwrap_or(ErrorClass::Fatal);
        let completed = snapshot.completed;
        let viable = completed >= self.min_viable;

        let mut fallback_options = vec![FallbackOption {
            kind:   FallbackKind::OriginalPreserved,
            impact: "The original model response is kept and remains available".to_string(),
        }];

        if viable {
            let quality = PartialQuality::for_samples(completed);
            fallback_options.push(FallbackOption {
                kind:   FallbackKind::PartialAnalysis,
                impact: format!(
                    "Grade the {completed} collected samples ({quality} quality); results are \
                     less reliable than a full run of {}",
                    snapshot.target
                ),
            });
        }

        if class == ErrorClass::GraderUnavailable && viable {
            fallback_options.push(FallbackOption {
                kind:   FallbackKind::StatisticalFallback,
                impact: "Grade from exact-match rate, length variance and unique-response count \
                         without the judging model; lower confidence"
                    .to_string(),
            });
        }

        fallback_options.push(FallbackOption {
            kind:   FallbackKind::ManualExport,
            impact: format!("Export the {completed} collected samples for manual review"),
        });

        let mut recommendations = Vec::new();
        if class == ErrorClass::Throttle {
            recommendations.push(format!(
                "The backend is rate limiting; retry with fewer samples than {}",
                snapshot.target
            ));
        }
        if viable {
            recommendations.push(format!("Continue with the {completed} samples already collected"));
        }

        DegradationPlan {
            original_result_preserved: true,
            fallback_options,
            recovery_actions: self.actions(class, completed),
            recommendations,
            error: self.surface(snapshot, error),
        }
    }

    /// User-facing form of `error`, naming how many samples survived.
    pub fn surface(&self, snapshot: &EvaluationSnapshot, error: &EngineError) -> SurfacedError {
        let class = error.class().unwrap_or(ErrorClass::Fatal);
        let completed = snapshot.completed;
        let salvage = if completed == 0 {
            "No samples were collected before the failure".to_string()
        } else {
            format!(
                "{completed} of {} samples were collected and kept",
                snapshot.target
            )
        };

        SurfacedError {
            class,
            message: format!("{error}. {salvage}. The original response is preserved."),
            salvaged_samples: completed,
            actions: self.actions(class, completed),
        }
    }

    /// Recovery actions for a failure class, most useful first.
    pub fn actions(&self, class: ErrorClass, completed: usize) -> Vec<RecoveryAction> {
        let viable = completed >= self.min_viable;
        let mut actions = Vec::new();
        match class {
            ErrorClass::Throttle => {
                actions.push(RecoveryAction::WaitAndRetry);
                if viable {
                    actions.push(RecoveryAction::ContinueWithPartial);
                }
                actions.push(RecoveryAction::ReduceSampleCount);
            }
            ErrorClass::TransientNetwork => {
                actions.push(RecoveryAction::WaitAndRetry);
                if viable {
                    actions.push(RecoveryAction::ContinueWithPartial);
                }
            }
            ErrorClass::Fatal => {
                if viable {
                    actions.push(RecoveryAction::ContinueWithPartial);
                }
            }
            ErrorClass::GraderUnavailable => {
                if viable {
                    actions.push(RecoveryAction::StatisticalFallback);
                }
                actions.push(RecoveryAction::WaitAndRetry);
            }
            ErrorClass::InsufficientData => {
                actions.push(RecoveryAction::ReduceSampleCount);
                actions.push(RecoveryAction::WaitAndRetry);
            }
        }
        actions.push(RecoveryAction::Export);
        actions.push(RecoveryAction::Cancel);
        actions
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{AttemptStats, Phase};

    fn snapshot(completed: usize) -> EvaluationSnapshot {
        EvaluationSnapshot {
            phase: Phase::Error,
            completed,
            target: 10,
            abandoned: 0,
            attempts: AttemptStats::default(),
            elapsed: Duration::from_secs(30),
            since_last_progress: Duration::from_secs(5),
            connectivity_lost: false,
        }
    }

    #[test]
    fn original_and_export_are_always_offered() {
        let plan = DegradationPlanner::default()
            .plan(&snapshot(0), &EngineError::Fatal("invalid api key".into()));
        assert!(plan.original_result_preserved);
        assert!(plan.offers(FallbackKind::OriginalPreserved));
        assert!(plan.offers(FallbackKind::ManualExport));
        assert!(!plan.offers(FallbackKind::PartialAnalysis));
        assert_eq!(plan.recovery_actions, vec![
            RecoveryAction::Export,
            RecoveryAction::Cancel
        ]);
        assert!(
            plan.error
                .message
                .contains("No samples were collected before the failure")
        );
    }

    #[test]
    fn partial_analysis_requires_minimum_samples() {
        let planner = DegradationPlanner::default();
        let error = EngineError::TransientNetwork("connection reset".into());
        assert!(!planner.plan(&snapshot(2), &error).offers(FallbackKind::PartialAnalysis));

        let plan = planner.plan(&snapshot(6), &error);
        let partial = plan
            .fallback_options
            .iter()
            .find(|option| option.kind == FallbackKind::PartialAnalysis)
            .expect("partial analysis offered");
        assert!(partial.impact.contains("good quality"));
        assert_eq!(plan.error.salvaged_samples, 6);
        assert!(plan.error.message.contains("6 of 10 samples"));
    }

    #[test]
    fn statistical_fallback_only_for_grader_outage() {
        let planner = DegradationPlanner::default();
        let outage = EngineError::GraderUnavailable("judge returned 503".into());
        let plan = planner.plan(&snapshot(4), &outage);
        assert!(plan.offers(FallbackKind::StatisticalFallback));
        assert_eq!(plan.recovery_actions[0], RecoveryAction::StatisticalFallback);

        assert!(!planner.plan(&snapshot(2), &outage).offers(FallbackKind::StatisticalFallback));
        assert!(
            !planner
                .plan(&snapshot(4), &EngineError::Throttle("429".into()))
                .offers(FallbackKind::StatisticalFallback)
        );
    }

    #[test]
    fn throttling_recommends_fewer_samples() {
        let plan = DegradationPlanner::default()
            .plan(&snapshot(1), &EngineError::Throttle("429".into()));
        assert!(plan.recommendations[0].contains("retry with fewer samples"));
        assert_eq!(plan.recovery_actions, vec![
            RecoveryAction::WaitAndRetry,
            RecoveryAction::ReduceSampleCount,
            RecoveryAction::Export,
            RecoveryAction::Cancel,
        ]);
    }
}
