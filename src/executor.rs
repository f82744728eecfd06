use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::{
    config::ModelRequest,
    llm::{InvokeError, ModelClient, RawToolCall},
    model::{SampleResult, ToolCallRecord, ToolUsage},
};

/// Classified result of one invocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(SampleResult),
    Throttled {
        retry_after: Option<Duration>,
        cause:       String,
    },
    TransientFailure {
        cause: String,
    },
    FatalFailure {
        cause: String,
    },
}

impl AttemptOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::Throttled { .. } => "throttled",
            AttemptOutcome::TransientFailure { .. } => "transient",
            AttemptOutcome::FatalFailure { .. } => "fatal",
        }
    }
}

/// Where an attempt sits within its sample's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    pub slot:           usize,
    /// Retries already consumed by this sample.
    pub retries:        u32,
    pub throttled_once: bool,
}

/// Issues single invocation attempts and classifies their outcome.
#[derive(Clone)]
pub struct RequestExecutor {
    client:  Arc<dyn ModelClient>,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(client: Arc<dyn ModelClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn attempt(&self, request: &ModelRequest, context: AttemptContext) -> AttemptOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.client.invoke(request)).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let response = match result {
            Err(_) => {
                debug!(slot = context.slot, timeout_ms = ?self.timeout.as_millis(), "attempt.timed_out");
                return AttemptOutcome::TransientFailure {
                    cause: format!("no response within {} ms", self.timeout.as_millis()),
                };
            }
            Ok(Err(err)) => return classify(&err),
            Ok(Ok(response)) => response,
        };

        let calls = response
            .tool_calls
            .iter()
            .map(|call| validate_tool_call(request, call))
            .collect();

        AttemptOutcome::Success(SampleResult {
            slot:         context.slot,
            text:         response.text,
            token_usage:  response.token_usage,
            tool_usage:   ToolUsage::from_calls(calls),
            latency_ms:   response.latency_ms.unwrap_or(elapsed_ms),
            throttled:    context.throttled_once,
            retries:      context.retries,
            completed_at: Utc::now(),
        })
    }
}

/// Map a client error onto the retry taxonomy.
pub fn classify(err: &InvokeError) -> AttemptOutcome {
    let cause = err.to_string();
    match err {
        InvokeError::RateLimited { retry_after, .. } => AttemptOutcome::Throttled {
            retry_after: *retry_after,
            cause,
        },
        InvokeError::Status { status, message } => match status {
            429 => AttemptOutcome::Throttled {
                retry_after: None,
                cause,
            },
            _ if is_throttle_message(message) => AttemptOutcome::Throttled {
                retry_after: None,
                cause,
            },
            408 | 425 | 500..=599 => AttemptOutcome::TransientFailure { cause },
            400..=499 => AttemptOutcome::FatalFailure { cause },
            _ => AttemptOutcome::TransientFailure { cause },
        },
        InvokeError::Network(message) if is_throttle_message(message) => {
            AttemptOutcome::Throttled {
                retry_after: None,
                cause,
            }
        }
        InvokeError::Network(_) | InvokeError::Timeout => {
            AttemptOutcome::TransientFailure { cause }
        }
        InvokeError::Unauthorized(_) | InvokeError::InvalidRequest(_) => {
            AttemptOutcome::FatalFailure { cause }
        }
        InvokeError::Other(message) => {
            if is_throttle_message(message) {
                AttemptOutcome::Throttled {
                    retry_after: None,
                    cause,
                }
            } else if is_fatal_message(message) {
                AttemptOutcome::FatalFailure { cause }
            } else {
                AttemptOutcome::TransientFailure { cause }
            }
        }
    }
}

fn is_throttle_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ["too many requests", "rate limit", "rate-limit", "throttl", "429"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn is_fatal_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    [
        "unauthorized",
        "forbidden",
        "permission",
        "access denied",
        "invalid api key",
        "validation",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

fn validate_tool_call(request: &ModelRequest, call: &RawToolCall) -> ToolCallRecord {
    let parsed: Result<Value, _> = serde_json::from_str(&call.arguments);
    let (arguments, validation_error) = match parsed {
        Ok(value @ Value::Object(_)) => {
            let missing: Vec<&str> = request
                .tool(&call.name)
                .map(|tool| {
                    tool.required_parameters()
                        .into_iter()
                        .filter(|key| value.get(*key).is_none())
                        .collect()
                })
                .unwrap_or_default();
            let error = if request.tool(&call.name).is_none() && !request.tools.is_empty() {
                Some(format!("unknown tool '{}'", call.name))
            } else if !missing.is_empty() {
                Some(format!("missing required parameters: {}", missing.join(", ")))
            } else {
                None
            };
            (value, error)
        }
        Ok(other) => (other, Some("arguments are not a JSON object".to_string())),
        Err(err) => (
            Value::String(call.arguments.clone()),
            Some(format!("arguments are not valid JSON: {err}")),
        ),
    };

    ToolCallRecord {
        name: call.name.clone(),
        arguments,
        valid: validation_error.is_none(),
        validation_error,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        config::ToolDefinition,
        llm::ModelResponse,
        testing::{ScriptedClient, Step},
    };

    fn context() -> AttemptContext {
        AttemptContext {
            slot:           0,
            retries:        0,
            throttled_once: false,
        }
    }

    #[test]
    fn rate_limit_signals_map_to_throttled() {
        let explicit = InvokeError::RateLimited {
            message:     "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(matches!(
            classify(&explicit),
            AttemptOutcome::Throttled {
                retry_after: Some(_),
                ..
            }
        ));

        let status = InvokeError::Status {
            status:  429,
            message: "".into(),
        };
        assert_eq!(classify(&status).kind(), "throttled");

        let worded = InvokeError::Other("ThrottlingException: Too Many Requests".into());
        assert_eq!(classify(&worded).kind(), "throttled");
    }

    #[test]
    fn network_and_server_errors_are_transient() {
        assert_eq!(classify(&InvokeError::Timeout).kind(), "transient");
        assert_eq!(
            classify(&InvokeError::Network("connection reset".into())).kind(),
            "transient"
        );
        let status = InvokeError::Status {
            status:  503,
            message: "unavailable".into(),
        };
        assert_eq!(classify(&status).kind(), "transient");
    }

    #[test]
    fn credential_and_validation_errors_are_fatal() {
        assert_eq!(
            classify(&InvokeError::Unauthorized("bad key".into())).kind(),
            "fatal"
        );
        let status = InvokeError::Status {
            status:  403,
            message: "forbidden".into(),
        };
        assert_eq!(classify(&status).kind(), "fatal");
        assert_eq!(
            classify(&InvokeError::Other("ValidationException: bad input".into())).kind(),
            "fatal"
        );
    }

    #[tokio::test]
    async fn success_records_validated_tool_calls() {
        let request = ModelRequest::new("model-x", "Find the order.").with_tool(ToolDefinition {
            name:        "lookup_order".into(),
            description: None,
            parameters:  json!({"type": "object", "required": ["order_id"]}),
        });
        let response = ModelResponse {
            text:        "Looking it up.".into(),
            tool_calls:  vec![
                RawToolCall {
                    name:      "lookup_order".into(),
                    arguments: r#"{"order_id": "A1"}"#.into(),
                },
                RawToolCall {
                    name:      "lookup_order".into(),
                    arguments: r#"{"customer": "x"}"#.into(),
                },
                RawToolCall {
                    name:      "lookup_order".into(),
                    arguments: "not json".into(),
                },
            ],
            token_usage: None,
            latency_ms:  Some(42),
        };
        let client = ScriptedClient::new(vec![Step::Respond(response)]);
        let executor = RequestExecutor::new(Arc::new(client), Duration::from_secs(5));

        let AttemptOutcome::Success(sample) = executor.attempt(&request, context()).await else {
            panic!("expected success");
        };
        assert_eq!(sample.latency_ms, 42);
        assert_eq!(sample.tool_usage.attempted, 3);
        assert_eq!(sample.tool_usage.executed, 1);
        assert!(sample.tool_usage.calls[1].validation_error.is_some());
        assert!(!sample.tool_usage.calls[2].valid);
    }

    #[tokio::test]
    async fn slow_call_times_out_as_transient() {
        let client = ScriptedClient::new(vec![Step::Delay(
            Duration::from_millis(200),
            Box::new(Step::Respond(ModelResponse::text("late"))),
        )]);
        let executor = RequestExecutor::new(Arc::new(client), Duration::from_millis(10));
        let request = ModelRequest::new("model-x", "hello");
        let outcome = executor.attempt(&request, context()).await;
        assert_eq!(outcome.kind(), "transient");
    }
}
