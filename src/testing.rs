//! Scripted collaborators shared by the test modules.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    config::{EvaluationConfig, ModelRequest},
    llm::{ConsistencyJudge, InvokeError, JudgeError, JudgeVerdict, ModelClient, ModelResponse},
    model::{SampleResult, ToolUsage},
};

/// One scripted reply of the model client.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(ModelResponse),
    Fail(InvokeError),
    Delay(Duration, Box<Step>),
}

impl Step {
    pub fn text(text: &str) -> Self {
        Step::Respond(ModelResponse::text(text))
    }

    pub fn throttle() -> Self {
        Step::Fail(InvokeError::Status {
            status:  429,
            message: "Too Many Requests".into(),
        })
    }

    pub fn network() -> Self {
        Step::Fail(InvokeError::Network("connection reset by peer".into()))
    }

    pub fn fatal() -> Self {
        Step::Fail(InvokeError::Unauthorized("invalid api key".into()))
    }
}

/// Model client that replays steps in call order, then a fallback step.
pub struct ScriptedClient {
    steps:    Mutex<VecDeque<Step>>,
    fallback: Step,
    calls:    AtomicUsize,
    gate:     Option<Arc<Semaphore>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps:    Mutex::new(steps.into()),
            fallback: Step::text("ok"),
            calls:    AtomicUsize::new(0),
            gate:     None,
        }
    }

    pub fn with_fallback(mut self, fallback: Step) -> Self {
        self.fallback = fallback;
        self
    }

    /// Every call waits for a permit on `gate` before replying.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().expect("scripted steps lock");
        steps.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn invoke(&self, _request: &ModelRequest) -> Result<ModelResponse, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut step = self.next_step();
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        loop {
            match step {
                Step::Respond(response) => return Ok(response),
                Step::Fail(err) => return Err(err),
                Step::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }
}

/// Judge returning a fixed verdict or failing every time.
pub struct FixedJudge {
    verdict: Option<JudgeVerdict>,
    calls:   AtomicUsize,
}

impl FixedJudge {
    pub fn agreeing() -> Self {
        Self {
            verdict: Some(JudgeVerdict {
                decision_consistency: 1.0,
                semantic_equivalence: 1.0,
                notable_variations:   Vec::new(),
            }),
            calls:   AtomicUsize::new(0),
        }
    }

    pub fn verdict(verdict: JudgeVerdict) -> Self {
        Self {
            verdict: Some(verdict),
            calls:   AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            verdict: None,
            calls:   AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsistencyJudge for FixedJudge {
    async fn judge(
        &self,
        _original_response: &str,
        _responses: &[String],
        _instructions: Option<&str>,
    ) -> Result<JudgeVerdict, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
            .clone()
            .ok_or_else(|| JudgeError::Unavailable("judge endpoint returned 503".into()))
    }
}

pub fn config(test_id: &str, samples: usize, retries: u32) -> EvaluationConfig {
    let mut config = EvaluationConfig::new(
        test_id,
        ModelRequest::new("model-x", "Classify the ticket: 'refund not received'."),
        "billing",
    );
    config.target_sample_count = samples;
    config.max_retry_attempts = retries;
    config
}

pub fn sample(slot: usize, text: &str) -> SampleResult {
    SampleResult {
        slot,
        text: text.to_string(),
        token_usage: None,
        tool_usage: ToolUsage::default(),
        latency_ms: 10,
        throttled: false,
        retries: 0,
        completed_at: chrono::Utc::now(),
    }
}
