use std::{
    collections::HashMap,
    future::{Future, ready},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use kameo::{
    Actor,
    actor::ActorRef,
    error::SendError,
    message::{Context, Message},
};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    bus::{StatusBus, StatusSnapshot, Subscription},
    config::{EngineConfig, EvaluationConfig, EvaluationSettings},
    degradation::{DegradationPlan, DegradationPlanner},
    error::{EngineError, SurfacedError},
    executor::{AttemptOutcome, RequestExecutor},
    export::EvaluationExport,
    grader::ConsistencyGrader,
    health::{EvaluationSnapshot, Health, HealthMonitor},
    llm::{ConsistencyJudge, ModelClient},
    model::{AttemptStats, EvaluationId, Grade, Phase, SampleResult, ThrottleStats},
    scheduler::{BackoffScheduler, Decision, SampleSlot},
};

/// Begin an evaluation, or return the running one for the same test id.
pub struct Start {
    pub config: EvaluationConfig,
}

pub struct Subscribe {
    pub id: EvaluationId,
}

pub struct Unsubscribe {
    pub id:    EvaluationId,
    pub token: u64,
}

pub struct Pause {
    pub id: EvaluationId,
}

pub struct Resume {
    pub id: EvaluationId,
}

pub struct Cancel {
    pub id: EvaluationId,
}

/// Grade whatever has been collected and finish the evaluation.
pub struct CompleteWithPartialData {
    pub id:     EvaluationId,
    pub reason: String,
}

/// Start a fresh evaluation with the same reference request and a new budget.
pub struct RetryWithModifiedSettings {
    pub id:       EvaluationId,
    pub settings: EvaluationSettings,
}

/// Grade an evaluation that failed on the judge without consulting it.
pub struct CompleteWithStatisticalFallback {
    pub id: EvaluationId,
}

pub struct AssessHealth {
    pub id: EvaluationId,
}

pub struct GetDegradationPlan {
    pub id: EvaluationId,
}

pub struct Export {
    pub id: EvaluationId,
}

/// Drop a finished evaluation and close its status channel.
pub struct Forget {
    pub id: EvaluationId,
}

pub struct Snapshot {
    pub id: EvaluationId,
}

/// An attempt task finished.
pub struct AttemptFinished {
    id:      EvaluationId,
    epoch:   u64,
    slot:    SampleSlot,
    outcome: AttemptOutcome,
}

/// A retry's backoff timer fired.
pub struct BackoffElapsed {
    id:    EvaluationId,
    epoch: u64,
    slot:  SampleSlot,
}

/// A grading task finished.
pub struct GradingFinished {
    id:     EvaluationId,
    epoch:  u64,
    result: Result<Grade, EngineError>,
}

/// Mutable state of one evaluation, owned by the controller.
struct Run {
    id:                    EvaluationId,
    /// Bumped whenever outstanding task results must be ignored.
    epoch:                 u64,
    config:                EvaluationConfig,
    phase:                 Phase,
    resume_to:             Phase,
    scheduler:             BackoffScheduler,
    samples:               Vec<SampleResult>,
    throttle_stats:        ThrottleStats,
    attempts:              AttemptStats,
    consecutive_transient: u32,
    last_abandon:          Option<EngineError>,
    partial:               bool,
    completion_reason:     Option<String>,
    held_grading:          Option<Result<Grade, EngineError>>,
    grade:                 Option<Grade>,
    error:                 Option<EngineError>,
    surfaced:              Option<SurfacedError>,
    throttle_alert:        Option<String>,
    started_at:            Instant,
    last_progress:         Instant,
    updated_at:            DateTime<Utc>,
    tasks:                 Vec<AbortHandle>,
}

impl Run {
    fn new(id: EvaluationId, config: EvaluationConfig, engine: &EngineConfig) -> Self {
        let scheduler = BackoffScheduler::new(
            engine.backoff.clone(),
            engine.concurrency_window,
            config.target_sample_count,
            config.max_retry_attempts,
        );
        let now = Instant::now();
        Self {
            id,
            epoch: 0,
            config,
            phase: Phase::Idle,
            resume_to: Phase::Collecting,
            scheduler,
            samples: Vec::new(),
            throttle_stats: ThrottleStats::default(),
            attempts: AttemptStats::default(),
            consecutive_transient: 0,
            last_abandon: None,
            partial: false,
            completion_reason: None,
            held_grading: None,
            grade: None,
            error: None,
            surfaced: None,
            throttle_alert: None,
            started_at: now,
            last_progress: now,
            updated_at: Utc::now(),
            tasks: Vec::new(),
        }
    }

    /// Whether a task result tagged with `epoch` still belongs to this run.
    fn accepts(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.phase != Phase::Idle && !self.phase.is_terminal()
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(evaluation_id = %self.id, from = %self.phase, to = %phase, "evaluation.phase_changed");
            self.phase = phase;
        }
        self.updated_at = Utc::now();
    }

    fn track(&mut self, handle: AbortHandle) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle);
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn health_input(&self, connectivity_threshold: u32) -> EvaluationSnapshot {
        EvaluationSnapshot {
            phase:               self.phase,
            completed:           self.samples.len(),
            target:              self.config.target_sample_count,
            abandoned:           self.throttle_stats.abandoned_count as usize,
            attempts:            self.attempts,
            elapsed:             self.started_at.elapsed(),
            since_last_progress: self.last_progress.elapsed(),
            connectivity_lost:   self.consecutive_transient >= connectivity_threshold,
        }
    }

    fn progress_percent(&self) -> f64 {
        if self.phase == Phase::Completed {
            return 100.0;
        }
        let target = self.config.target_sample_count.max(1) as f64;
        let accounted = (self.samples.len() + self.throttle_stats.abandoned_count as usize) as f64;
        ((accounted / target * 100.0).min(100.0) * 10.0).round() / 10.0
    }

    /// Mean time per collected sample spread over the remaining samples and the window.
    fn eta_ms(&self) -> Option<u64> {
        if !matches!(self.phase, Phase::Collecting | Phase::Throttled) || self.samples.is_empty() {
            return None;
        }
        let per_sample = self.started_at.elapsed().as_millis() as f64 / self.samples.len() as f64;
        let remaining = self
            .config
            .target_sample_count
            .saturating_sub(self.samples.len() + self.throttle_stats.abandoned_count as usize);
        let window = self.scheduler.window().max(1) as f64;
        Some((per_sample * remaining as f64 / window).round() as u64)
    }

    fn status(&self, monitor: &HealthMonitor, engine: &EngineConfig) -> StatusSnapshot {
        let input = self.health_input(engine.connectivity_failure_threshold);
        StatusSnapshot {
            evaluation_id:               self.id,
            phase:                       self.phase,
            progress_percent:            self.progress_percent(),
            completed_count:             self.samples.len(),
            total_target:                self.config.target_sample_count,
            in_flight:                   self.scheduler.in_flight(),
            throttle_stats:              self.throttle_stats,
            estimated_time_remaining_ms: self.eta_ms(),
            grade:                       self.grade.clone(),
            error:                       self.surfaced.clone(),
            health:                      monitor.assess(&input),
            throttle_alert:              self.throttle_alert.clone(),
            updated_at:                  self.updated_at,
        }
    }
}

/// Single writer for every evaluation's state. All task results come back through the
/// mailbox, so updates to one evaluation are applied in order and never concurrently.
#[derive(Actor)]
pub struct EvaluationController {
    executor: RequestExecutor,
    judge:    Option<Arc<dyn ConsistencyJudge>>,
    grader:   ConsistencyGrader,
    monitor:  HealthMonitor,
    planner:  DegradationPlanner,
    engine:   EngineConfig,
    runs:     HashMap<EvaluationId, Run>,
    /// Test id to the evaluation currently running for it.
    active:   HashMap<String, EvaluationId>,
    bus:      StatusBus,
}

impl EvaluationController {
    pub fn new(
        client: Arc<dyn ModelClient>,
        judge: Option<Arc<dyn ConsistencyJudge>>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            executor: RequestExecutor::new(client, engine.attempt_timeout),
            judge,
            grader: ConsistencyGrader::default(),
            monitor: HealthMonitor::new(engine.health.clone()),
            planner: DegradationPlanner::default(),
            engine,
            runs: HashMap::new(),
            active: HashMap::new(),
            bus: StatusBus::new(),
        }
    }

    fn run(&self, id: EvaluationId) -> Result<&Run, EngineError> {
        self.runs.get(&id).ok_or(EngineError::NotFound(id))
    }

    fn run_mut(&mut self, id: EvaluationId) -> Result<&mut Run, EngineError> {
        self.runs.get_mut(&id).ok_or(EngineError::NotFound(id))
    }

    fn start(
        &mut self,
        config: EvaluationConfig,
        myself: &ActorRef<Self>,
    ) -> Result<EvaluationId, EngineError> {
        config.validate()?;

        if let Some(existing) = self.active.get(&config.test_id).copied() {
            info!(test_id = %config.test_id, evaluation_id = %existing, "evaluation.start_ignored");
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let mut run = Run::new(id, config, &self.engine);
        info!(
            evaluation_id = %id,
            test_id = %run.config.test_id,
            model = %run.config.request.model_id,
            target = run.config.target_sample_count,
            max_retries = run.config.max_retry_attempts,
            window = run.scheduler.window(),
            "evaluation.started"
        );
        run.set_phase(Phase::Collecting);
        self.active.insert(run.config.test_id.clone(), id);
        self.runs.insert(id, run);

        self.advance(id, myself);
        self.publish(id);
        Ok(id)
    }

    /// Fill the concurrency window and move to grading once collection has concluded.
    fn advance(&mut self, id: EvaluationId, myself: &ActorRef<Self>) {
        let collected = {
            let Some(run) = self.runs.get_mut(&id) else {
                return;
            };
            if !matches!(run.phase, Phase::Collecting | Phase::Throttled) {
                return;
            }
            for slot in run.scheduler.dispatch() {
                spawn_attempt(run, slot, &self.executor, myself);
            }
            run.scheduler.collection_done()
        };

        if collected {
            self.begin_grading(id, myself, false);
        }
    }

    fn begin_grading(&mut self, id: EvaluationId, myself: &ActorRef<Self>, fallback: bool) {
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };

        let available = run.samples.len();
        let required = self.grader.min_viable();
        if available < required {
            let error = run
                .last_abandon
                .clone()
                .unwrap_or(EngineError::InsufficientData {
                    available,
                    required,
                });
            self.fail(id, error);
            return;
        }

        run.set_phase(Phase::Evaluating);
        let partial = run.partial || available < run.config.target_sample_count;
        info!(evaluation_id = %id, samples = available, partial, "evaluation.grading");

        let grader = self.grader.clone();
        let judge = self.judge.clone();
        let samples = run.samples.clone();
        let original = run.config.original_response.clone();
        let instructions = run.config.grader_instructions.clone();
        let epoch = run.epoch;
        let myself = myself.clone();

        let handle = tokio::spawn(async move {
            let graded = grader
                .grade(
                    &samples,
                    &original,
                    instructions.as_deref(),
                    judge.as_deref(),
                    partial,
                )
                .await;
            let result = match graded {
                Err(EngineError::GraderUnavailable(cause)) if fallback => {
                    warn!(evaluation_id = %id, cause = %cause, "grading.statistical_fallback");
                    grader.statistical_fallback(&samples, &original, partial)
                }
                other => other,
            };
            let _ = myself.tell(GradingFinished { id, epoch, result }).await;
        });
        run.track(handle.abort_handle());
    }

    fn complete(&mut self, id: EvaluationId, grade: Grade) {
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        run.abort_tasks();
        run.scheduler.halt();
        info!(
            evaluation_id = %id,
            letter = %grade.letter,
            score = grade.score,
            method = ?grade.method,
            samples = grade.responses_used_for_grading.len(),
            partial = grade.partial,
            "evaluation.completed"
        );
        run.grade = Some(grade);
        run.error = None;
        run.surfaced = None;
        run.set_phase(Phase::Completed);
        let test_id = run.config.test_id.clone();
        self.release(&test_id, id);
    }

    fn fail(&mut self, id: EvaluationId, error: EngineError) {
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        run.abort_tasks();
        run.scheduler.halt();
        let input = run.health_input(self.engine.connectivity_failure_threshold);
        let surfaced = self.planner.surface(&input, &error);
        warn!(
            evaluation_id = %id,
            class = ?surfaced.class,
            salvaged = surfaced.salvaged_samples,
            error = %error,
            "evaluation.failed"
        );
        run.error = Some(error);
        run.surfaced = Some(surfaced);
        run.set_phase(Phase::Error);
        let test_id = run.config.test_id.clone();
        self.release(&test_id, id);
    }

    fn release(&mut self, test_id: &str, id: EvaluationId) {
        if self.active.get(test_id) == Some(&id) {
            self.active.remove(test_id);
        }
    }

    /// Broadcast the evaluation's current status. A pending throttle alert goes out once.
    fn publish(&mut self, id: EvaluationId) {
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        let status = run.status(&self.monitor, &self.engine);
        run.throttle_alert = None;
        self.bus.publish(status);
    }

    fn attempt_finished(&mut self, msg: AttemptFinished, myself: &ActorRef<Self>) {
        let AttemptFinished {
            id,
            epoch,
            slot,
            outcome,
        } = msg;
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        if !run.accepts(epoch) {
            debug!(evaluation_id = %id, slot = slot.index, outcome = outcome.kind(), "attempt.stale_dropped");
            return;
        }

        run.attempts.total += 1;
        match &outcome {
            AttemptOutcome::Success(_) => {
                run.attempts.succeeded += 1;
                run.consecutive_transient = 0;
            }
            AttemptOutcome::Throttled { .. } => {
                run.attempts.throttled += 1;
                run.throttle_stats.throttled_count += 1;
            }
            AttemptOutcome::TransientFailure { .. } => {
                run.attempts.failed += 1;
                run.consecutive_transient += 1;
            }
            AttemptOutcome::FatalFailure { .. } => run.attempts.failed += 1,
        }

        let mut escalation = None;
        match run.scheduler.on_outcome(slot, &outcome) {
            Decision::Record => {
                if let AttemptOutcome::Success(sample) = outcome {
                    info!(
                        evaluation_id = %id,
                        slot = sample.slot,
                        retries = sample.retries,
                        latency_ms = sample.latency_ms,
                        completed = run.samples.len() + 1,
                        target = run.config.target_sample_count,
                        "sample.recorded"
                    );
                    run.samples.push(sample);
                }
                run.last_progress = Instant::now();
            }
            Decision::Retry { slot, delay } => {
                match &outcome {
                    AttemptOutcome::Throttled { cause, .. } => {
                        if run.phase == Phase::Collecting {
                            run.set_phase(Phase::Throttled);
                        }
                        if run.config.enable_throttle_alerts {
                            warn!(
                                evaluation_id = %id,
                                slot = slot.index,
                                retry = slot.retries,
                                delay_ms = delay.as_millis() as u64,
                                cause = %cause,
                                "attempt.throttled"
                            );
                            run.throttle_alert = Some(format!(
                                "Backend is throttling requests; sample {} retries in {} ms (retry {} of {})",
                                slot.index + 1,
                                delay.as_millis(),
                                slot.retries,
                                run.config.max_retry_attempts
                            ));
                        } else {
                            debug!(evaluation_id = %id, slot = slot.index, retry = slot.retries, "attempt.throttled");
                        }
                    }
                    other => {
                        debug!(
                            evaluation_id = %id,
                            slot = slot.index,
                            retry = slot.retries,
                            delay_ms = delay.as_millis() as u64,
                            outcome = other.kind(),
                            "attempt.retrying"
                        );
                    }
                }
                spawn_backoff(run, slot, delay, myself);
            }
            Decision::Abandon { slot, cause } => {
                warn!(
                    evaluation_id = %id,
                    slot = slot.index,
                    retries = slot.retries,
                    cause = %cause,
                    "sample.abandoned"
                );
                run.throttle_stats.abandoned_count += 1;
                run.last_progress = Instant::now();
                run.last_abandon = Some(match outcome {
                    AttemptOutcome::Throttled { .. } => EngineError::Throttle(cause),
                    _ => EngineError::TransientNetwork(cause),
                });
            }
            Decision::Escalate { cause } => {
                warn!(evaluation_id = %id, slot = slot.index, cause = %cause, "evaluation.escalated");
                escalation = Some(cause);
            }
        }

        match escalation {
            Some(cause) => self.fail(id, EngineError::Fatal(cause)),
            None => self.advance(id, myself),
        }
        self.publish(id);
    }

    fn backoff_elapsed(&mut self, msg: BackoffElapsed, myself: &ActorRef<Self>) {
        let BackoffElapsed { id, epoch, slot } = msg;
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        if !run.accepts(epoch) {
            return;
        }
        run.scheduler.backoff_elapsed(slot);
        if run.phase == Phase::Throttled && !run.scheduler.throttle_pending() {
            run.set_phase(Phase::Collecting);
        }
        self.advance(id, myself);
        self.publish(id);
    }

    fn grading_finished(&mut self, msg: GradingFinished) {
        let GradingFinished { id, epoch, result } = msg;
        let Some(run) = self.runs.get_mut(&id) else {
            return;
        };
        if run.epoch != epoch {
            return;
        }
        match run.phase {
            Phase::Evaluating => {}
            Phase::Paused if run.resume_to == Phase::Evaluating => {
                debug!(evaluation_id = %id, "grading.held_while_paused");
                run.held_grading = Some(result);
                return;
            }
            phase => {
                debug!(evaluation_id = %id, phase = %phase, "grading.stale_dropped");
                return;
            }
        }

        match result {
            Ok(grade) => self.complete(id, grade),
            Err(err) => self.fail(id, err),
        }
        self.publish(id);
    }

    fn pause(&mut self, id: EvaluationId) -> Result<(), EngineError> {
        let run = self.run_mut(id)?;
        run.resume_to = match run.phase {
            Phase::Collecting | Phase::Throttled => Phase::Collecting,
            Phase::Evaluating => Phase::Evaluating,
            phase => {
                return Err(EngineError::InvalidTransition {
                    operation: "pause",
                    phase,
                });
            }
        };
        run.set_phase(Phase::Paused);
        info!(
            evaluation_id = %id,
            completed = run.samples.len(),
            in_flight = run.scheduler.in_flight(),
            "evaluation.paused"
        );
        self.publish(id);
        Ok(())
    }

    fn resume(&mut self, id: EvaluationId, myself: &ActorRef<Self>) -> Result<(), EngineError> {
        let run = self.run_mut(id)?;
        if run.phase != Phase::Paused {
            return Err(EngineError::InvalidTransition {
                operation: "resume",
                phase:     run.phase,
            });
        }
        let resume_to = match run.resume_to {
            Phase::Collecting if run.scheduler.throttle_pending() => Phase::Throttled,
            phase => phase,
        };
        run.set_phase(resume_to);
        run.last_progress = Instant::now();
        info!(evaluation_id = %id, completed = run.samples.len(), phase = %resume_to, "evaluation.resumed");

        match run.held_grading.take() {
            Some(Ok(grade)) => self.complete(id, grade),
            Some(Err(err)) => self.fail(id, err),
            None => self.advance(id, myself),
        }
        self.publish(id);
        Ok(())
    }

    fn cancel(&mut self, id: EvaluationId) -> Result<(), EngineError> {
        let window = self.engine.concurrency_window;
        let backoff = self.engine.backoff.clone();
        let run = self.run_mut(id)?;
        match run.phase {
            Phase::Idle => return Ok(()),
            Phase::Completed | Phase::Error => {
                return Err(EngineError::InvalidTransition {
                    operation: "cancel",
                    phase:     run.phase,
                });
            }
            _ => {}
        }

        run.abort_tasks();
        run.epoch += 1;
        let discarded = run.samples.len();
        run.samples.clear();
        run.held_grading = None;
        run.throttle_alert = None;
        run.scheduler = BackoffScheduler::new(
            backoff,
            window,
            run.config.target_sample_count,
            run.config.max_retry_attempts,
        );
        run.scheduler.halt();
        run.set_phase(Phase::Idle);
        info!(evaluation_id = %id, discarded, "evaluation.cancelled");

        let test_id = run.config.test_id.clone();
        self.release(&test_id, id);
        self.publish(id);
        Ok(())
    }

    /// Grade the collected subset in place: the evaluation keeps its id rather than
    /// starting a new one. Accepted from `Collecting` and `Paused` as well as from `Error`
    /// and `Throttled`.
    fn complete_with_partial_data(
        &mut self,
        id: EvaluationId,
        reason: String,
        myself: &ActorRef<Self>,
    ) -> Result<(), EngineError> {
        let required = self.grader.min_viable();
        let run = self.run_mut(id)?;
        if !matches!(
            run.phase,
            Phase::Error | Phase::Throttled | Phase::Collecting | Phase::Paused
        ) {
            return Err(EngineError::InvalidTransition {
                operation: "complete with partial data",
                phase:     run.phase,
            });
        }
        let available = run.samples.len();
        if available < required {
            return Err(EngineError::InsufficientData {
                available,
                required,
            });
        }

        run.abort_tasks();
        run.scheduler.halt();
        run.epoch += 1;
        run.held_grading = None;
        run.error = None;
        run.surfaced = None;
        run.partial = available < run.config.target_sample_count;
        info!(
            evaluation_id = %id,
            samples = available,
            target = run.config.target_sample_count,
            reason = %reason,
            "evaluation.partial_completion"
        );
        run.completion_reason = Some(reason);
        let test_id = run.config.test_id.clone();
        self.active.entry(test_id).or_insert(id);

        self.begin_grading(id, myself, true);
        self.publish(id);
        Ok(())
    }

    fn retry_with_modified_settings(
        &mut self,
        id: EvaluationId,
        settings: EvaluationSettings,
        myself: &ActorRef<Self>,
    ) -> Result<EvaluationId, EngineError> {
        let run = self.run(id)?;
        let config = run.config.with_budget(&settings);
        config.validate()?;
        if run.phase.is_active() {
            self.cancel(id)?;
        }
        let next = self.start(config, myself)?;
        info!(evaluation_id = %next, previous = %id, target = settings.test_count, "evaluation.retried");
        Ok(next)
    }

    fn complete_with_statistical_fallback(&mut self, id: EvaluationId) -> Result<Grade, EngineError> {
        let run = self.run(id)?;
        let grader_outage = run.phase == Phase::Error
            && matches!(run.error, Some(EngineError::GraderUnavailable(_)));
        if !grader_outage {
            return Err(EngineError::InvalidTransition {
                operation: "apply statistical fallback to",
                phase:     run.phase,
            });
        }
        let partial = run.partial || run.samples.len() < run.config.target_sample_count;
        let grade =
            self.grader
                .statistical_fallback(&run.samples, &run.config.original_response, partial)?;
        self.complete(id, grade.clone());
        self.publish(id);
        Ok(grade)
    }

    fn degradation_plan(&self, id: EvaluationId) -> Result<DegradationPlan, EngineError> {
        let run = self.run(id)?;
        let (Phase::Error, Some(error)) = (run.phase, &run.error) else {
            return Err(EngineError::InvalidTransition {
                operation: "plan recovery for",
                phase:     run.phase,
            });
        };
        let input = run.health_input(self.engine.connectivity_failure_threshold);
        Ok(self.planner.plan(&input, error))
    }

    fn export(&self, id: EvaluationId) -> Result<EvaluationExport, EngineError> {
        let run = self.run(id)?;
        Ok(EvaluationExport {
            evaluation_id:     id,
            test_id:           run.config.test_id.clone(),
            phase:             run.phase,
            config:            run.config.clone(),
            grade:             run.grade.clone(),
            metrics:           run.grade.as_ref().map(|grade| grade.metrics.clone()),
            samples:           run.samples.clone(),
            throttle_stats:    run.throttle_stats,
            attempt_stats:     run.attempts,
            error:             run.surfaced.clone(),
            completion_reason: run.completion_reason.clone(),
            exported_at:       Utc::now(),
        })
    }

    fn forget(&mut self, id: EvaluationId) -> Result<(), EngineError> {
        let run = self.run(id)?;
        if run.phase.is_active() {
            return Err(EngineError::InvalidTransition {
                operation: "forget",
                phase:     run.phase,
            });
        }
        let test_id = run.config.test_id.clone();
        self.release(&test_id, id);
        self.runs.remove(&id);
        self.bus.close(id);
        info!(evaluation_id = %id, "evaluation.forgotten");
        Ok(())
    }
}

fn spawn_attempt(
    run: &mut Run,
    slot: SampleSlot,
    executor: &RequestExecutor,
    myself: &ActorRef<EvaluationController>,
) {
    let executor = executor.clone();
    let request = run.config.request.clone();
    let myself = myself.clone();
    let (id, epoch) = (run.id, run.epoch);
    debug!(evaluation_id = %id, slot = slot.index, retry = slot.retries, "attempt.dispatched");

    let handle = tokio::spawn(async move {
        let outcome = executor.attempt(&request, slot.context()).await;
        let _ = myself
            .tell(AttemptFinished {
                id,
                epoch,
                slot,
                outcome,
            })
            .await;
    });
    run.track(handle.abort_handle());
}

fn spawn_backoff(
    run: &mut Run,
    slot: SampleSlot,
    delay: Duration,
    myself: &ActorRef<EvaluationController>,
) {
    let myself = myself.clone();
    let (id, epoch) = (run.id, run.epoch);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = myself.tell(BackoffElapsed { id, epoch, slot }).await;
    });
    run.track(handle.abort_handle());
}

impl Message<Start> for EvaluationController {
    type Reply = Result<EvaluationId, EngineError>;

    fn handle(
        &mut self,
        msg: Start,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let myself = ctx.actor_ref().clone();
        ready(self.start(msg.config, &myself))
    }
}

impl Message<Subscribe> for EvaluationController {
    type Reply = Result<Subscription, EngineError>;

    fn handle(
        &mut self,
        msg: Subscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let reply = if self.runs.contains_key(&msg.id) {
            Ok(self.bus.subscribe(msg.id))
        } else {
            Err(EngineError::NotFound(msg.id))
        };
        ready(reply)
    }
}

impl Message<Unsubscribe> for EvaluationController {
    type Reply = Result<bool, EngineError>;

    fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(Ok(self.bus.unsubscribe(msg.id, msg.token)))
    }
}

impl Message<Pause> for EvaluationController {
    type Reply = Result<(), EngineError>;

    fn handle(
        &mut self,
        msg: Pause,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(self.pause(msg.id))
    }
}

impl Message<Resume> for EvaluationController {
    type Reply = Result<(), EngineError>;

    fn handle(
        &mut self,
        msg: Resume,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let myself = ctx.actor_ref().clone();
        ready(self.resume(msg.id, &myself))
    }
}

impl Message<Cancel> for EvaluationController {
    type Reply = Result<(), EngineError>;

    fn handle(
        &mut self,
        msg: Cancel,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(self.cancel(msg.id))
    }
}

impl Message<CompleteWithPartialData> for EvaluationController {
    type Reply = Result<(), EngineError>;

    fn handle(
        &mut self,
        msg: CompleteWithPartialData,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let myself = ctx.actor_ref().clone();
        ready(self.complete_with_partial_data(msg.id, msg.reason, &myself))
    }
}

impl Message<RetryWithModifiedSettings> for EvaluationController {
    type Reply = Result<EvaluationId, EngineError>;

    fn handle(
        &mut self,
        msg: RetryWithModifiedSettings,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let myself = ctx.actor_ref().clone();
        ready(self.retry_with_modified_settings(msg.id, msg.settings, &myself))
    }
}

impl Message<CompleteWithStatisticalFallback> for EvaluationController {
    type Reply = Result<Grade, EngineError>;

    fn handle(
        &mut self,
        msg: CompleteWithStatisticalFallback,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(self.complete_with_statistical_fallback(msg.id))
    }
}

impl Message<AssessHealth> for EvaluationController {
    type Reply = Result<Health, EngineError>;

    fn handle(
        &mut self,
        msg: AssessHealth,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let threshold = self.engine.connectivity_failure_threshold;
        let reply = self
            .run(msg.id)
            .map(|run| self.monitor.assess(&run.health_input(threshold)));
        ready(reply)
    }
}

impl Message<GetDegradationPlan> for EvaluationController {
    type Reply = Result<DegradationPlan, EngineError>;

    fn handle(
        &mut self,
        msg: GetDegradationPlan,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(self.degradation_plan(msg.id))
    }
}

impl Message<Export> for EvaluationController {
    type Reply = Result<EvaluationExport, EngineError>;

    fn handle(
        &mut self,
        msg: Export,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(self.export(msg.id))
    }
}

impl Message<Forget> for EvaluationController {
    type Reply = Result<(), EngineError>;

    fn handle(
        &mut self,
        msg: Forget,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        ready(self.forget(msg.id))
    }
}

impl Message<Snapshot> for EvaluationController {
    type Reply = Result<StatusSnapshot, EngineError>;

    fn handle(
        &mut self,
        msg: Snapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let reply = self
            .run(msg.id)
            .map(|run| run.status(&self.monitor, &self.engine));
        ready(reply)
    }
}

impl Message<AttemptFinished> for EvaluationController {
    type Reply = ();

    fn handle(
        &mut self,
        msg: AttemptFinished,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let myself = ctx.actor_ref().clone();
        self.attempt_finished(msg, &myself);
        ready(())
    }
}

impl Message<BackoffElapsed> for EvaluationController {
    type Reply = ();

    fn handle(
        &mut self,
        msg: BackoffElapsed,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        let myself = ctx.actor_ref().clone();
        self.backoff_elapsed(msg, &myself);
        ready(())
    }
}

impl Message<GradingFinished> for EvaluationController {
    type Reply = ();

    fn handle(
        &mut self,
        msg: GradingFinished,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> impl Future<Output = Self::Reply> + Send {
        self.grading_finished(msg);
        ready(())
    }
}

fn reply<M, T>(result: Result<T, SendError<M, EngineError>>) -> Result<T, EngineError> {
    result.map_err(|err| match err {
        SendError::HandlerError(err) => err,
        _ => EngineError::ControllerUnavailable,
    })
}

/// Cloneable handle to a running [`EvaluationController`].
#[derive(Clone)]
pub struct EvaluationEngine {
    controller: ActorRef<EvaluationController>,
}

impl EvaluationEngine {
    pub fn spawn(
        client: Arc<dyn ModelClient>,
        judge: Option<Arc<dyn ConsistencyJudge>>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let controller = EvaluationController::spawn(EvaluationController::new(client, judge, config));
        Ok(Self { controller })
    }

    pub fn actor_ref(&self) -> &ActorRef<EvaluationController> {
        &self.controller
    }

    /// Start an evaluation. While one is running for the same test id, its id is returned
    /// and nothing new is issued.
    pub async fn start(&self, config: EvaluationConfig) -> Result<EvaluationId, EngineError> {
        reply(self.controller.ask(Start { config }).await)
    }

    /// Status stream for `id`, beginning with its latest snapshot.
    pub async fn subscribe(&self, id: EvaluationId) -> Result<Subscription, EngineError> {
        reply(self.controller.ask(Subscribe { id }).await)
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<bool, EngineError> {
        reply(
            self.controller
                .ask(Unsubscribe {
                    id:    subscription.evaluation_id(),
                    token: subscription.token(),
                })
                .await,
        )
    }

    pub async fn pause(&self, id: EvaluationId) -> Result<(), EngineError> {
        reply(self.controller.ask(Pause { id }).await)
    }

    pub async fn resume(&self, id: EvaluationId) -> Result<(), EngineError> {
        reply(self.controller.ask(Resume { id }).await)
    }

    pub async fn cancel(&self, id: EvaluationId) -> Result<(), EngineError> {
        reply(self.controller.ask(Cancel { id }).await)
    }

    /// Grade the samples collected so far and wait for the resulting grade.
    pub async fn complete_with_partial_data(
        &self,
        id: EvaluationId,
        reason: impl Into<String>,
    ) -> Result<Grade, EngineError> {
        reply(
            self.controller
                .ask(CompleteWithPartialData {
                    id,
                    reason: reason.into(),
                })
                .await,
        )?;
        let outcome = self.wait_for_outcome(id).await?;
        match (outcome.phase, outcome.grade, outcome.error) {
            (Phase::Completed, Some(grade), _) => Ok(grade),
            (_, _, Some(surfaced)) => Err(EngineError::from_surfaced(&surfaced)),
            (phase, ..) => Err(EngineError::InvalidTransition {
                operation: "complete with partial data",
                phase,
            }),
        }
    }

    pub async fn retry_with_modified_settings(
        &self,
        id: EvaluationId,
        settings: EvaluationSettings,
    ) -> Result<EvaluationId, EngineError> {
        reply(
            self.controller
                .ask(RetryWithModifiedSettings { id, settings })
                .await,
        )
    }

    pub async fn complete_with_statistical_fallback(
        &self,
        id: EvaluationId,
    ) -> Result<Grade, EngineError> {
        reply(
            self.controller
                .ask(CompleteWithStatisticalFallback { id })
                .await,
        )
    }

    pub async fn assess_health(&self, id: EvaluationId) -> Result<Health, EngineError> {
        reply(self.controller.ask(AssessHealth { id }).await)
    }

    pub async fn degradation_plan(&self, id: EvaluationId) -> Result<DegradationPlan, EngineError> {
        reply(self.controller.ask(GetDegradationPlan { id }).await)
    }

    pub async fn export(&self, id: EvaluationId) -> Result<EvaluationExport, EngineError> {
        reply(self.controller.ask(Export { id }).await)
    }

    /// Grade, metrics and every collected sample as a JSON document.
    pub async fn export_evaluation_data(&self, id: EvaluationId) -> Result<String, EngineError> {
        self.export(id).await?.to_json()
    }

    pub async fn snapshot(&self, id: EvaluationId) -> Result<StatusSnapshot, EngineError> {
        reply(self.controller.ask(Snapshot { id }).await)
    }

    pub async fn forget(&self, id: EvaluationId) -> Result<(), EngineError> {
        reply(self.controller.ask(Forget { id }).await)
    }

    /// Wait until the evaluation completes, fails or is cancelled.
    pub async fn wait_for_outcome(&self, id: EvaluationId) -> Result<StatusSnapshot, EngineError> {
        let mut subscription = self.subscribe(id).await?;
        while let Some(snapshot) = subscription.recv().await {
            if snapshot.phase.is_terminal() || snapshot.phase == Phase::Idle {
                return Ok(snapshot);
            }
        }
        Err(EngineError::NotFound(id))
    }

    pub async fn shutdown(&self) {
        let _ = self.controller.stop_gracefully().await;
    }
}
