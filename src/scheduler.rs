use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use rand::Rng;

use crate::{
    constants::{DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_JITTER, DEFAULT_BACKOFF_MAX_MS},
    executor::{AttemptContext, AttemptOutcome},
};

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay:  Duration,
    /// Fraction of the computed delay that jitter may add or remove, `0.0..=1.0`.
    pub jitter:     f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            max_delay:  Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            jitter:     DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Delay before the `retry`-th retry of a sample (1-based). A backend hint raises the
    /// delay but never past `max_delay`.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let jittered = apply_jitter(raw.min(self.max_delay), self.jitter);
        let delay = match hint {
            Some(hint) => jittered.max(hint),
            None => jittered,
        };
        delay.min(self.max_delay)
    }
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor)
}

/// One sample position being worked toward the target count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSlot {
    pub index:          usize,
    pub retries:        u32,
    pub throttled_once: bool,
}

impl SampleSlot {
    fn fresh(index: usize) -> Self {
        Self {
            index,
            retries: 0,
            throttled_once: false,
        }
    }

    pub fn context(&self) -> AttemptContext {
        AttemptContext {
            slot:           self.index,
            retries:        self.retries,
            throttled_once: self.throttled_once,
        }
    }
}

/// What the controller should do with a finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Attempt succeeded; record its sample.
    Record,
    /// Wait `delay`, then hand the slot back through [`BackoffScheduler::backoff_elapsed`].
    Retry { slot: SampleSlot, delay: Duration },
    /// Retries exhausted; the slot no longer counts toward completion.
    Abandon { slot: SampleSlot, cause: String },
    /// Configuration-class failure; stop the evaluation.
    Escalate { cause: String },
}

/// Decides which samples run, how many at once, and how failures are retried.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    policy:      BackoffPolicy,
    window:      usize,
    target:      usize,
    max_retries: u32,
    next_index:  usize,
    ready:       VecDeque<SampleSlot>,
    backing_off: usize,
    /// Slots waiting out a throttle backoff; no fresh slot is issued while any remain.
    throttled:   HashSet<usize>,
    in_flight:   usize,
    completed:   usize,
    abandoned:   usize,
    halted:      bool,
}

impl BackoffScheduler {
    pub fn new(policy: BackoffPolicy, window: usize, target: usize, max_retries: u32) -> Self {
        Self {
            policy,
            window: window.max(1),
            target,
            max_retries,
            next_index: 0,
            ready: VecDeque::new(),
            backing_off: 0,
            throttled: HashSet::new(),
            in_flight: 0,
            completed: 0,
            abandoned: 0,
            halted: false,
        }
    }

    /// Slots to issue now, filling the concurrency window. A slot waiting out a backoff
    /// keeps its seat. Retries go before fresh slots, and fresh slots wait while the
    /// backend is throttling.
    pub fn dispatch(&mut self) -> Vec<SampleSlot> {
        let mut slots = Vec::new();
        while !self.halted && self.in_flight + self.backing_off < self.window {
            let slot = match self.ready.pop_front() {
                Some(slot) => slot,
                None if self.throttled.is_empty() && self.accounted() < self.target => {
                    let slot = SampleSlot::fresh(self.next_index);
                    self.next_index += 1;
                    slot
                }
                None => break,
            };
            self.in_flight += 1;
            slots.push(slot);
        }
        slots
    }

    pub fn on_outcome(&mut self, slot: SampleSlot, outcome: &AttemptOutcome) -> Decision {
        self.in_flight = self.in_flight.saturating_sub(1);
        match outcome {
            AttemptOutcome::Success(_) => {
                self.completed += 1;
                Decision::Record
            }
            AttemptOutcome::Throttled { retry_after, cause } => {
                let slot = SampleSlot {
                    throttled_once: true,
                    ..slot
                };
                let decision = self.retry_or_abandon(slot, *retry_after, cause);
                if matches!(decision, Decision::Retry { .. }) {
                    self.throttled.insert(slot.index);
                }
                decision
            }
            AttemptOutcome::TransientFailure { cause } => self.retry_or_abandon(slot, None, cause),
            AttemptOutcome::FatalFailure { cause } => {
                self.halt();
                Decision::Escalate {
                    cause: cause.clone(),
                }
            }
        }
    }

    fn retry_or_abandon(
        &mut self,
        mut slot: SampleSlot,
        hint: Option<Duration>,
        cause: &str,
    ) -> Decision {
        if slot.retries >= self.max_retries {
            self.abandoned += 1;
            return Decision::Abandon {
                slot,
                cause: cause.to_string(),
            };
        }
        slot.retries += 1;
        self.backing_off += 1;
        Decision::Retry {
            slot,
            delay: self.policy.delay_for(slot.retries, hint),
        }
    }

    /// A retry's backoff has run out; queue it for the next dispatch.
    pub fn backoff_elapsed(&mut self, slot: SampleSlot) {
        self.backing_off = self.backing_off.saturating_sub(1);
        self.throttled.remove(&slot.index);
        if !self.halted {
            self.ready.push_back(slot);
        }
    }

    /// Stop issuing anything further. Outstanding attempts and timers are the caller's to
    /// abort, so nothing is counted as in flight or backing off afterwards.
    pub fn halt(&mut self) {
        self.halted = true;
        self.ready.clear();
        self.in_flight = 0;
        self.backing_off = 0;
        self.throttled.clear();
    }

    /// Whether a throttled slot is still waiting out its backoff.
    pub fn throttle_pending(&self) -> bool {
        !self.throttled.is_empty()
    }

    pub fn collection_done(&self) -> bool {
        self.completed + self.abandoned >= self.target
    }

    fn accounted(&self) -> usize {
        self.completed + self.abandoned + self.in_flight + self.backing_off + self.ready.len()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn backing_off(&self) -> usize {
        self.backing_off
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample;

    fn scheduler(target: usize, max_retries: u32) -> BackoffScheduler {
        BackoffScheduler::new(
            BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_secs(2)),
            3,
            target,
            max_retries,
        )
    }

    fn throttled() -> AttemptOutcome {
        AttemptOutcome::Throttled {
            retry_after: None,
            cause:       "429".into(),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4, None), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(500));
    }

    #[test]
    fn retry_after_hint_raises_delay_within_cap() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(30))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1_000),
            max_delay:  Duration::from_secs(60),
            jitter:     0.25,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1, None);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1_250), "{delay:?}");
        }
    }

    #[test]
    fn dispatch_respects_window_and_target() {
        let mut scheduler = scheduler(4, 3);
        let first = scheduler.dispatch();
        assert_eq!(first.len(), 3);
        assert!(scheduler.dispatch().is_empty());

        let outcome = AttemptOutcome::Success(sample(first[0].index, "a"));
        assert_eq!(scheduler.on_outcome(first[0], &outcome), Decision::Record);
        let second = scheduler.dispatch();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].index, 3);

        for slot in first[1..].iter().chain(second.iter()) {
            let outcome = AttemptOutcome::Success(sample(slot.index, "a"));
            scheduler.on_outcome(*slot, &outcome);
        }
        assert!(scheduler.collection_done());
        assert!(scheduler.dispatch().is_empty());
    }

    #[test]
    fn fresh_slots_wait_while_a_throttled_slot_backs_off() {
        let mut scheduler = scheduler(6, 3);
        let first = scheduler.dispatch();
        assert_eq!(first.len(), 3);

        let Decision::Retry { slot, .. } = scheduler.on_outcome(first[0], &throttled()) else {
            panic!("expected retry");
        };
        assert!(scheduler.throttle_pending());
        for other in &first[1..] {
            let outcome = AttemptOutcome::Success(sample(other.index, "a"));
            scheduler.on_outcome(*other, &outcome);
        }
        assert!(
            scheduler.dispatch().is_empty(),
            "window has free seats but the backend is throttling"
        );

        scheduler.backoff_elapsed(slot);
        assert!(!scheduler.throttle_pending());
        let next = scheduler.dispatch();
        assert_eq!(next[0], slot);
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn transient_backoff_keeps_its_window_seat() {
        let mut scheduler = scheduler(6, 3);
        let first = scheduler.dispatch();
        let transient = AttemptOutcome::TransientFailure {
            cause: "connection reset".into(),
        };
        let Decision::Retry { slot, .. } = scheduler.on_outcome(first[0], &transient) else {
            panic!("expected retry");
        };
        assert!(!scheduler.throttle_pending());
        assert!(scheduler.dispatch().is_empty());

        scheduler.backoff_elapsed(slot);
        assert_eq!(scheduler.dispatch(), vec![slot]);
    }

    #[test]
    fn halt_clears_in_flight_and_backoff_counts() {
        let mut scheduler = scheduler(6, 3);
        let slots = scheduler.dispatch();
        scheduler.on_outcome(slots[0], &throttled());
        assert_eq!(scheduler.in_flight(), 2);
        assert_eq!(scheduler.backing_off(), 1);

        scheduler.halt();
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.backing_off(), 0);
        assert!(!scheduler.throttle_pending());
        assert!(scheduler.dispatch().is_empty());
    }

    #[test]
    fn throttled_slot_retries_then_abandons() {
        let mut scheduler = scheduler(3, 2);
        let slot = scheduler.dispatch()[0];

        let Decision::Retry { slot, delay } = scheduler.on_outcome(slot, &throttled()) else {
            panic!("expected retry");
        };
        assert_eq!(slot.retries, 1);
        assert!(slot.throttled_once);
        assert_eq!(delay, Duration::from_millis(100));
        assert!(scheduler.dispatch().is_empty(), "backing-off slot keeps its place");

        scheduler.backoff_elapsed(slot);
        let retried = scheduler.dispatch();
        assert_eq!(retried, vec![slot]);

        let Decision::Retry { slot, delay } = scheduler.on_outcome(slot, &throttled()) else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_millis(200));
        scheduler.backoff_elapsed(slot);
        let slot = scheduler.dispatch()[0];

        assert!(matches!(
            scheduler.on_outcome(slot, &throttled()),
            Decision::Abandon { .. }
        ));
        assert_eq!(scheduler.abandoned(), 1);
    }

    #[test]
    fn abandoned_samples_do_not_block_completion() {
        let mut scheduler = scheduler(10, 3);
        let mut permanently_throttled = 0;
        let mut rounds = 0;

        while !scheduler.collection_done() {
            rounds += 1;
            assert!(rounds < 200, "scheduler made no progress");
            for slot in scheduler.dispatch() {
                let outcome = if slot.index < 4 {
                    throttled()
                } else {
                    AttemptOutcome::Success(sample(slot.index, "same"))
                };
                match scheduler.on_outcome(slot, &outcome) {
                    Decision::Retry { slot, .. } => scheduler.backoff_elapsed(slot),
                    Decision::Abandon { .. } => permanently_throttled += 1,
                    Decision::Record => {}
                    Decision::Escalate { .. } => panic!("unexpected escalation"),
                }
            }
        }

        assert_eq!(permanently_throttled, 4);
        assert_eq!(scheduler.abandoned(), 4);
        assert_eq!(scheduler.completed(), 6);
        assert!(scheduler.dispatch().is_empty());
    }

    #[test]
    fn fatal_failure_halts_without_retry() {
        let mut scheduler = scheduler(5, 3);
        let slots = scheduler.dispatch();
        let decision = scheduler.on_outcome(slots[0], &AttemptOutcome::FatalFailure {
            cause: "bad key".into(),
        });
        assert_eq!(decision, Decision::Escalate {
            cause: "bad key".into(),
        });
        assert!(scheduler.dispatch().is_empty());
        scheduler.backoff_elapsed(slots[1]);
        assert!(scheduler.dispatch().is_empty());
    }
}
