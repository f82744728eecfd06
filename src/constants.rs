/// Default number of repeated samples per evaluation.
pub const DEFAULT_TEST_COUNT: usize = 10;

/// Smallest sample target an evaluation may be configured with.
pub const MIN_TEST_COUNT: usize = 3;

/// Largest sample target an evaluation may be configured with.
pub const MAX_TEST_COUNT: usize = 50;

/// Default retries per sample after the first attempt.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Upper bound accepted for the per-sample retry cap.
pub const MAX_RETRY_ATTEMPTS_LIMIT: u32 = 10;

/// Fewest completed samples the grader will produce a grade from.
pub const MIN_VIABLE_SAMPLES: usize = 3;

/// Completed samples at which partial data counts as `good`.
pub const GOOD_PARTIAL_SAMPLES: usize = 5;

/// Default number of attempts in flight per evaluation.
pub const DEFAULT_CONCURRENCY_WINDOW: usize = 3;

/// First backoff delay applied to a throttled or failed attempt, in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Ceiling for any single backoff delay, in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Fraction of the computed delay that jitter may add or remove.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.25;

/// Default bound on a single model invocation, in milliseconds.
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 120_000;

/// Seconds without a progress update before a running evaluation is flagged as stalled.
pub const DEFAULT_STALL_WINDOW_SECS: u64 = 60;

/// Seconds after which an evaluation under half complete is flagged as slow.
pub const DEFAULT_SLOW_WINDOW_SECS: u64 = 300;

/// Failed-attempt fraction above which health turns critical.
pub const DEFAULT_CRITICAL_ERROR_RATE: f64 = 0.30;

/// Throttled-attempt fraction above which health turns critical.
pub const DEFAULT_CRITICAL_THROTTLE_RATE: f64 = 0.50;

/// Attempts that must have finished before rates are judged.
pub const DEFAULT_MIN_ATTEMPTS_FOR_RATES: u32 = 5;

/// Consecutive transient failures that count as lost connectivity.
pub const DEFAULT_CONNECTIVITY_FAILURE_THRESHOLD: u32 = 3;

/// Grading weights. Changing any of these changes the meaning of historical grades.
pub const WEIGHT_DECISION: f64 = 0.30;
pub const WEIGHT_SEMANTIC: f64 = 0.25;
pub const WEIGHT_STRUCTURAL: f64 = 0.15;
pub const WEIGHT_TOOL_USAGE: f64 = 0.15;
pub const WEIGHT_EXACT_MATCH: f64 = 0.10;
pub const WEIGHT_LENGTH: f64 = 0.05;

/// Maximum number of notable variations reported on a grade.
pub const MAX_NOTABLE_VARIATIONS: usize = 8;

/// Default temperature applied to judge requests.
pub const JUDGE_TEMPERATURE: f32 = 0.0;
