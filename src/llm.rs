use std::{env, time::Duration};

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionObjectArgs,
        ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{ModelRequest, ToolDefinition},
    constants::JUDGE_TEMPERATURE,
    model::TokenUsage,
};

/// Errors surfaced while building a backend client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing OPENAI_API_KEY in environment")]
    MissingApiKey,
}

/// Failure of a single model invocation, as reported by the client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvokeError {
    #[error("rate limited: {message}")]
    RateLimited {
        message:     String,
        retry_after: Option<Duration>,
    },
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invocation failed: {0}")]
    Other(String),
}

/// Tool call as emitted by the model, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    pub name:      String,
    pub arguments: String,
}

/// Successful response of one model invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text:        String,
    pub tool_calls:  Vec<RawToolCall>,
    pub token_usage: Option<TokenUsage>,
    /// Backend-reported latency; the executor measures wall time when absent.
    pub latency_ms:  Option<u64>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Issues one invocation of the reference request.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, InvokeError>;
}

/// Errors from the judging model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),
    #[error("failed to parse judge response: {0}")]
    InvalidResponse(String),
}

/// Meaning-level comparison returned by a judge. Scores are in `0.0..=1.0`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct JudgeVerdict {
    pub decision_consistency: f64,
    pub semantic_equivalence: f64,
    pub notable_variations:   Vec<String>,
}

/// Compares collected responses at the level of meaning and decision.
#[async_trait]
pub trait ConsistencyJudge: Send + Sync {
    async fn judge(
        &self,
        original_response: &str,
        responses: &[String],
        instructions: Option<&str>,
    ) -> Result<JudgeVerdict, JudgeError>;
}

/// Model client for OpenAI-compatible chat completion backends.
#[derive(Debug, Clone)]
pub struct OpenAiModelClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiModelClient {
    pub fn from_env() -> Result<Self, LlmError> {
        Ok(Self::with_config(config_from_env()?))
    }

    pub fn with_config(config: OpenAIConfig) -> Self {
        Self {
            client: build_client(config),
        }
    }

    fn messages(request: &ModelRequest) -> Result<Vec<ChatCompletionRequestMessage>, InvokeError> {
        let mut messages = Vec::with_capacity(2);

        if let Some(system_prompt) = request.system_prompt.as_deref()
            && !system_prompt.trim().is_empty()
        {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(|err| InvokeError::InvalidRequest(err.to_string()))?
                    .into(),
            );
        }

        let user_prompt = match request.dataset_content.as_deref() {
            Some(dataset) if !dataset.trim().is_empty() => {
                format!("{}\n\nDataset:\n{}", request.user_prompt, dataset)
            }
            _ => request.user_prompt.clone(),
        };
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt)
                .build()
                .map_err(|err| InvokeError::InvalidRequest(err.to_string()))?
                .into(),
        );

        Ok(messages)
    }

    fn tool_specs(tools: &[ToolDefinition]) -> Result<Vec<ChatCompletionTool>, InvokeError> {
        tools
            .iter()
            .map(|tool| {
                let mut function = FunctionObjectArgs::default();
                function.name(tool.name.clone()).parameters(tool.parameters.clone());
                if let Some(description) = &tool.description {
                    function.description(description.clone());
                }
                let function = function
                    .build()
                    .map_err(|err| InvokeError::InvalidRequest(err.to_string()))?;
                ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(function)
                    .build()
                    .map_err(|err| InvokeError::InvalidRequest(err.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, InvokeError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(request.model_id.clone())
            .messages(Self::messages(request)?);
        if !request.tools.is_empty() {
            args.tools(Self::tool_specs(&request.tools)?);
        }
        let chat_request = args
            .build()
            .map_err(|err| InvokeError::InvalidRequest(err.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify_openai_error)?;

        let token_usage = response.usage.as_ref().map(|usage| TokenUsage {
            prompt_tokens:     usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens:      usage.total_tokens,
        });

        let message = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InvokeError::Other("chat completion returned no choices".into()))?
            .message;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| RawToolCall {
                name:      call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        Ok(ModelResponse {
            text: message.content.unwrap_or_default(),
            tool_calls,
            token_usage,
            latency_ms: None,
        })
    }
}

/// Judge backed by an OpenAI-compatible model with a strict JSON schema response.
#[derive(Debug, Clone)]
pub struct OpenAiJudge {
    client: Client<OpenAIConfig>,
    model:  String,
}

impl OpenAiJudge {
    pub fn from_env() -> Result<Self, LlmError> {
        let model = env::var("OPENAI_JUDGE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self::with_config(config_from_env()?, model))
    }

    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: build_client(config),
            model:  model.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JudgePayload<'a> {
    original_response: &'a str,
    responses:         Vec<JudgeItem<'a>>,
}

#[derive(Debug, Serialize)]
struct JudgeItem<'a> {
    index: usize,
    text:  &'a str,
}

#[async_trait]
impl ConsistencyJudge for OpenAiJudge {
    async fn judge(
        &self,
        original_response: &str,
        responses: &[String],
        instructions: Option<&str>,
    ) -> Result<JudgeVerdict, JudgeError> {
        let mut system_prompt = String::from(
            r#"You grade how consistent repeated answers from the same model are.
Rules:
- Emit pure JSON matching the provided schema exactly.
- "decision_consistency" is the fraction of responses that reach the same decision, branch or conclusion as the majority (0.0 to 1.0).
- "semantic_equivalence" is how close the responses are in meaning, ignoring wording (0.0 to 1.0).
- "notable_variations" lists short, concrete differences between responses; use an empty list when there are none."#,
        );
        if let Some(extra) = instructions.filter(|text| !text.trim().is_empty()) {
            system_prompt.push_str("\nAdditional grading instructions:\n");
            system_prompt.push_str(extra);
        }

        let payload = JudgePayload {
            original_response,
            responses: responses
                .iter()
                .enumerate()
                .map(|(index, text)| JudgeItem { index, text })
                .collect(),
        };
        let payload_json = serde_json::to_string_pretty(&payload)
            .map_err(|err| JudgeError::InvalidResponse(err.to_string()))?;
        let user_prompt = format!(
            "Responses to compare (JSON):\n{payload_json}\nReturn ONLY JSON that satisfies the \
             schema."
        );

        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()
            .map_err(|err| JudgeError::Unavailable(err.to_string()))?;
        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(user_prompt)
            .build()
            .map_err(|err| JudgeError::Unavailable(err.to_string()))?;

        let schema = schema_for!(JudgeVerdict);
        let schema_value = serde_json::to_value(&schema)
            .map_err(|err| JudgeError::Unavailable(err.to_string()))?;

        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                name:        "consistency_verdict".into(),
                description: Some("Consistency assessment of repeated responses".into()),
                schema:      Some(schema_value),
                strict:      Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(vec![system_message.into(), user_message.into()])
            .temperature(JUDGE_TEMPERATURE)
            .response_format(response_format)
            .build()
            .map_err(|err| JudgeError::Unavailable(err.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|err| JudgeError::Unavailable(err.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| JudgeError::InvalidResponse("missing content".into()))?;

        let verdict: JudgeVerdict = serde_json::from_str(&content)
            .map_err(|err| JudgeError::InvalidResponse(err.to_string()))?;

        Ok(JudgeVerdict {
            decision_consistency: verdict.decision_consistency.clamp(0.0, 1.0),
            semantic_equivalence: verdict.semantic_equivalence.clamp(0.0, 1.0),
            notable_variations:   verdict.notable_variations,
        })
    }
}

fn config_from_env() -> Result<OpenAIConfig, LlmError> {
    let api_key = env::var("OPENAI_API_KEY").map_err(|_| LlmError::MissingApiKey)?;
    let base_url = env::var("OPENAI_BASE_URL").ok();

    let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
    if let Some(url) = base_url {
        openai_config = openai_config.with_api_base(url);
    }

    Ok(openai_config)
}

/// Client that reports every rate-limit response as it arrives. Retrying is left to the
/// backoff scheduler, so the client's own retry budget is zero.
fn build_client(config: OpenAIConfig) -> Client<OpenAIConfig> {
    let no_retries = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build();
    Client::with_config(config).with_backoff(no_retries)
}

fn classify_openai_error(err: OpenAIError) -> InvokeError {
    match err {
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or_default();
            let kind = api.r#type.as_deref().unwrap_or_default();
            match (code, kind) {
                ("rate_limit_exceeded", _) | (_, "requests") | (_, "tokens") => {
                    InvokeError::RateLimited {
                        message:     api.message,
                        retry_after: None,
                    }
                }
                ("invalid_api_key", _) | ("insufficient_quota", _) | (_, "authentication_error") => {
                    InvokeError::Unauthorized(api.message)
                }
                (_, "invalid_request_error") => InvokeError::InvalidRequest(api.message),
                (_, "server_error") => InvokeError::Status {
                    status:  500,
                    message: api.message,
                },
                _ => InvokeError::Other(api.message),
            }
        }
        OpenAIError::Reqwest(inner) => {
            if inner.is_timeout() {
                InvokeError::Timeout
            } else if let Some(status) = inner.status() {
                InvokeError::Status {
                    status:  status.as_u16(),
                    message: inner.to_string(),
                }
            } else {
                InvokeError::Network(inner.to_string())
            }
        }
        OpenAIError::InvalidArgument(message) => InvokeError::InvalidRequest(message),
        other => InvokeError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::executor::{AttemptContext, AttemptOutcome, RequestExecutor};

    const RATE_LIMIT_BODY: &str = r#"{"error":{"message":"Rate limit reached for requests","type":"requests","param":null,"code":"rate_limit_exceeded"}}"#;

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    /// Answers every request with 429 and counts how many reached it.
    async fn rate_limited_backend() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buffer = [0u8; 4096];
                    while !request_complete(&request) {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => return,
                            Ok(read) => request.extend_from_slice(&buffer[..read]),
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let response = format!(
                        "HTTP/1.1 429 Too Many Requests\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        RATE_LIMIT_BODY.len(),
                        RATE_LIMIT_BODY
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (format!("http://{address}/v1"), hits)
    }

    #[tokio::test]
    async fn rate_limited_backend_is_reported_without_client_retries() {
        let (base_url, hits) = rate_limited_backend().await;
        let config = OpenAIConfig::new()
            .with_api_key("test-key")
            .with_api_base(base_url);
        let client = Arc::new(OpenAiModelClient::with_config(config));
        let request = ModelRequest::new("model-x", "Classify the ticket.");

        let err = tokio::time::timeout(Duration::from_secs(5), client.invoke(&request))
            .await
            .expect("client returned without retrying")
            .expect_err("backend is rate limiting");
        assert!(matches!(err, InvokeError::RateLimited { .. }), "{err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let executor = RequestExecutor::new(client, Duration::from_secs(3));
        let context = AttemptContext {
            slot:           0,
            retries:        0,
            throttled_once: false,
        };
        let outcome = executor.attempt(&request, context).await;
        assert!(matches!(outcome, AttemptOutcome::Throttled { .. }), "{outcome:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
