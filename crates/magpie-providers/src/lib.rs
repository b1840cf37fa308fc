use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Tool declaration on the wire: name, description for the model, and a
/// JSON-schema object for the arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw argument text as returned by the model; may fail to parse.
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn label(&self) -> &str;
    async fn complete(&self, request: ChatRequest) -> anyhow::Result<ChatCompletion>;
}

/// Retry schedule for transient transport failures. `base_delay` of zero is
/// used by tests so no wall-clock sleeping happens.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }
}

/// Retry only transient transport failures: connect errors, timeouts, 5xx
/// and 429. Any other 4xx is surfaced immediately.
pub fn status_is_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Provider label inferred from model-name conventions; an explicit base
/// URL always wins over the inference.
pub fn provider_for_model(model: &str) -> &'static str {
    let lowered = model.to_ascii_lowercase();
    if lowered.starts_with("gpt") || lowered.starts_with("o1") || lowered.starts_with("o3") {
        "openai"
    } else if lowered.starts_with("claude") {
        "anthropic"
    } else if lowered.starts_with("llama")
        || lowered.starts_with("mistral")
        || lowered.starts_with("mixtral")
    {
        "ollama"
    } else {
        "openai-compatible"
    }
}

/// OpenAI-compatible chat-completions client. Covers OpenAI proper, LiteLLM
/// proxies, Ollama and LM Studio local endpoints; the wire contract is the
/// same messages/model/temperature/tools shape everywhere.
pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    retry: RetryPolicy,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: &str, api_key: Option<String>, default_model: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base(base_url),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            default_model: default_model.into(),
            retry: RetryPolicy::default(),
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn request_body(&self, request: &ChatRequest) -> (String, Value) {
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let wire_messages = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": false,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            let wire_tools = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect::<Vec<_>>();
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }
        (model, body)
    }

    async fn send_once(&self, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_wire_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            if status_is_retryable(status.as_u16()) {
                anyhow::bail!(TransientProviderError { detail });
            }
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_wire_error(&value) {
            anyhow::bail!(detail);
        }
        Ok(value)
    }
}

#[derive(Debug)]
pub struct TransientProviderError {
    pub detail: String,
}

impl std::fmt::Display for TransientProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl std::error::Error for TransientProviderError {}

fn error_is_transient(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<TransientProviderError>().is_some() {
        return true;
    }
    if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
        return req_err.is_timeout() || req_err.is_connect() || req_err.is_request();
    }
    false
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn label(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: ChatRequest) -> anyhow::Result<ChatCompletion> {
        let (model, body) = self.request_body(&request);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.send_once(&body).await {
                Ok(value) => return parse_completion(&value, &model),
                Err(err) => {
                    if !error_is_transient(&err) || attempt == self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        model = %model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "provider call failed transiently, retrying: {err}"
                    );
                    last_err = Some(err);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("provider call failed")))
    }
}

fn parse_completion(value: &Value, model: &str) -> anyhow::Result<ChatCompletion> {
    let message = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "provider returned no choices for model `{model}` (response: {})",
                truncate_for_error(&value.to_string(), 500)
            )
        })?;

    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    if name.trim().is_empty() {
                        return None;
                    }
                    Some(ToolCallRequest {
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name,
                        arguments: function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ChatCompletion {
        text,
        tool_calls,
        usage: extract_usage(value),
    })
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_wire_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let cut = input
            .char_indices()
            .take_while(|(idx, _)| *idx < max_len)
            .last()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(0);
        format!("{}...", &input[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_inference_matches_conventions() {
        assert_eq!(provider_for_model("gpt-4o-mini"), "openai");
        assert_eq!(provider_for_model("claude-3-5-sonnet"), "anthropic");
        assert_eq!(provider_for_model("llama3.1:8b"), "ollama");
        assert_eq!(provider_for_model("mixtral-8x7b"), "ollama");
        assert_eq!(provider_for_model("qwen2.5"), "openai-compatible");
    }

    #[test]
    fn retryable_statuses_are_429_and_5xx() {
        assert!(status_is_retryable(429));
        assert!(status_is_retryable(500));
        assert!(status_is_retryable(503));
        assert!(!status_is_retryable(400));
        assert!(!status_is_retryable(404));
        assert!(!status_is_retryable(422));
    }

    #[test]
    fn backoff_grows_exponentially_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn base_url_normalization_appends_v1_once() {
        assert_eq!(normalize_base("http://localhost:4000"), "http://localhost:4000/v1");
        assert_eq!(normalize_base("http://localhost:4000/v1/"), "http://localhost:4000/v1");
    }

    #[test]
    fn completion_parses_text_and_tool_calls() {
        let value = json!({
            "choices": [{
                "message": {
                    "content": "thinking...",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "search_tool", "arguments": "{\"query\":\"rust\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let completion = parse_completion(&value, "gpt-4o-mini").expect("completion");
        assert_eq!(completion.text, "thinking...");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "search_tool");
        let args = completion.tool_calls[0].parsed_arguments().expect("args");
        assert_eq!(args["query"], "rust");
        assert_eq!(completion.usage.expect("usage").total_tokens, 15);
    }

    #[test]
    fn malformed_tool_arguments_surface_as_parse_error() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "search_tool".to_string(),
            arguments: "{not json".to_string(),
        };
        assert!(call.parsed_arguments().is_err());
    }
}
