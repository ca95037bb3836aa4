//! OpenAI chat-completion adapter.
//!
//! Speaks the `/chat/completions` wire format, which also serves any
//! OpenAI-compatible host (set a different base URL via
//! [`OpenAIProvider::with_base_url`]).  Supports single-shot completion,
//! SSE streaming, and native function calling.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentkit::message::Role;
//! use agentkit::provider::{ChatMessage, CompletionRequest, Provider};
//! use agentkit::providers::openai::{Model, OpenAIProvider};
//!
//! # async fn demo() -> agentkit::error::Result<()> {
//! let provider = OpenAIProvider::new_with_model_enum("sk-...", Model::GPT4o);
//! let response = provider
//!     .complete(CompletionRequest::new(vec![ChatMessage::new(
//!         Role::User,
//!         "Explain lifetimes in one sentence.",
//!     )]))
//!     .await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::provider::{
    CompletionRequest, CompletionResponse, Provider, StreamSink, ToolCall, ToolChoice, Usage,
};
use crate::agentkit::providers::common::{
    check_status, env_var, for_each_sse_event, provider_role,
};
use crate::agentkit::providers::http_pool::get_http_client;

/// Default model applied when neither the request nor the configuration
/// names one.
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Default API base URL, without a trailing slash.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";

/// Environment variable overriding the default model.
pub const ENV_MODEL: &str = "OPENAI_MODEL";

/// OpenAI model identifiers (mid-2024 snapshot).  Every variant maps 1:1 to
/// the hyphenated model name the API expects; use [`model_to_string`] for
/// the literal.
pub enum Model {
    /// `gpt-4o` – omni flagship with text + image inputs.
    GPT4o,
    /// `gpt-4o-mini` – cost-effective GPT-4o derivative.
    GPT4oMini,
    /// `gpt-4-turbo` – 128k-context GPT-4 tier.
    GPT4Turbo,
    /// `gpt-4` – the original GPT-4 release.
    GPT4,
    /// `gpt-3.5-turbo` – fast, inexpensive legacy tier.
    GPT35Turbo,
}

/// Convert a [`Model`] variant into the string identifier the API expects.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::GPT4o => "gpt-4o",
        Model::GPT4oMini => "gpt-4o-mini",
        Model::GPT4Turbo => "gpt-4-turbo",
        Model::GPT4 => "gpt-4",
        Model::GPT35Turbo => "gpt-3.5-turbo",
    }
    .to_string()
}

/// Adapter for OpenAI's chat-completion API surface.
pub struct OpenAIProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Create a provider with an explicit model name.
    pub fn new(api_key: &str, model: &str) -> Self {
        let base_url = DEFAULT_BASE_URL;
        OpenAIProvider {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            client: get_http_client(base_url),
        }
    }

    /// Convenience wrapper taking a strongly typed model.
    pub fn new_with_model_enum(api_key: &str, model: Model) -> Self {
        Self::new(api_key, &model_to_string(model))
    }

    /// Point the adapter at a different OpenAI-compatible host.  The base
    /// URL should not carry a trailing slash.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let normalized = base_url.trim_end_matches('/');
        self.base_url = normalized.to_string();
        self.client = get_http_client(normalized);
        self
    }

    /// Construct from `OPENAI_API_KEY` and optional `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = env_var(ENV_API_KEY)
            .ok_or_else(|| AgentError::invalid_input(format!("{ENV_API_KEY} is not set")))?;
        let model = env_var(ENV_MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self::new(&api_key, &model))
    }

    /// Model used when the request does not override one.
    fn resolve_model(&self, request: &CompletionRequest) -> String {
        request.model.clone().unwrap_or_else(|| self.model.clone())
    }

    fn build_payload(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": provider_role(m.role), "content": m.content}))
            .collect();
        let mut payload = json!({
            "model": self.resolve_model(request),
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            payload["top_p"] = json!(top_p);
        }
        if stream {
            payload["stream"] = json!(true);
        }
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            },
                        })
                    })
                    .collect(),
            );
            payload["tool_choice"] = tool_choice_value(
                request.tool_choice.as_ref().unwrap_or(&ToolChoice::Auto),
            );
        }
        payload
    }

    async fn post_chat(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;
        check_status("openai", response).await
    }
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::None => json!("none"),
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Function(name) => {
            json!({"type": "function", "function": {"name": name}})
        }
    }
}

/// Parse a non-streaming chat-completion body into the uniform response.
fn parse_completion(value: &Value) -> Result<CompletionResponse> {
    let choice = value["choices"]
        .get(0)
        .ok_or_else(|| AgentError::internal("openai: response carries no choices"))?;
    let message = &choice["message"];

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let tool_call = ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: call["function"]["arguments"]
                    .as_str()
                    .unwrap_or("{}")
                    .to_string(),
            };
            tool_call.parsed_arguments()?;
            tool_calls.push(tool_call);
        }
    }

    let prompt = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let completion = value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(CompletionResponse {
        id: value["id"].as_str().unwrap_or_default().to_string(),
        model: value["model"].as_str().unwrap_or_default().to_string(),
        content: message["content"].as_str().unwrap_or_default().to_string(),
        finish_reason: choice["finish_reason"].as_str().map(|s| s.to_string()),
        usage: Usage::new(prompt, completion),
        tool_calls,
    })
}

/// Extract the text delta from one streaming event, if it carries any.
fn delta_text(value: &Value) -> Option<String> {
    value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        request.validate()?;
        let payload = self.build_payload(&request, false);
        let response = self.post_chat(&payload).await?;
        let body: Value = response.json().await?;
        parse_completion(&body)
    }

    async fn stream(&self, request: CompletionRequest, sink: StreamSink<'_>) -> Result<()> {
        request.validate()?;
        let payload = self.build_payload(&request, true);
        let response = self.post_chat(&payload).await?;
        for_each_sse_event(response, |event| {
            let value: Value = match serde_json::from_str(&event.data) {
                Ok(value) => value,
                // Tolerate non-JSON keepalive payloads between deltas.
                Err(_) => return Ok(true),
            };
            if let Some(delta) = delta_text(&value) {
                sink(&delta)?;
            }
            Ok(true)
        })
        .await
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    async fn complete_with_tools(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentkit::message::Role;
    use crate::agentkit::provider::{ChatMessage, ParameterSchema, ToolDefinition};

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::new(Role::User, "hi")])
    }

    #[test]
    fn test_payload_uses_configured_model_and_assistant_role() {
        let provider = OpenAIProvider::new("k", "gpt-4o-mini");
        let req = CompletionRequest::new(vec![
            ChatMessage::new(Role::System, "be terse"),
            ChatMessage::new(Role::Agent, "earlier reply"),
            ChatMessage::new(Role::User, "hi"),
        ]);
        let payload = provider.build_payload(&req, false);
        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["messages"][1]["role"], "assistant");
        assert!(payload.get("temperature").is_none());
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn test_request_model_overrides_configured_model() {
        let provider = OpenAIProvider::new("k", "gpt-4");
        let payload = provider.build_payload(&request().with_model("gpt-4-turbo"), false);
        assert_eq!(payload["model"], "gpt-4-turbo");
    }

    #[test]
    fn test_temperature_zero_is_sent_verbatim() {
        let provider = OpenAIProvider::new("k", "gpt-4");
        let payload = provider.build_payload(&request().with_temperature(0.0), false);
        assert_eq!(payload["temperature"], 0.0);
    }

    #[test]
    fn test_tool_payload_shape() {
        let provider = OpenAIProvider::new("k", "gpt-4");
        let tool = ToolDefinition {
            name: "calculator".into(),
            description: "Evaluates an expression.".into(),
            parameters: ParameterSchema::default(),
        };
        let req = request().with_tools(vec![tool], ToolChoice::Function("calculator".into()));
        let payload = provider.build_payload(&req, false);
        assert_eq!(payload["tools"][0]["type"], "function");
        assert_eq!(payload["tools"][0]["function"]["name"], "calculator");
        assert_eq!(payload["tool_choice"]["function"]["name"], "calculator");
    }

    #[test]
    fn test_parse_completion_with_usage() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10},
        });
        let response = parse_completion(&body).unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 10);
    }

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let body = serde_json::json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "calc", "arguments": "{\"x\": 2}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1},
        });
        let response = parse_completion(&body).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "calc");
        assert_eq!(
            response.tool_calls[0].parsed_arguments().unwrap()["x"],
            2
        );
    }

    #[test]
    fn test_invalid_tool_arguments_rejected() {
        let body = serde_json::json!({
            "id": "c", "model": "m",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "call_1", "function": {"name": "calc", "arguments": "not json"}}],
                },
                "finish_reason": "tool_calls",
            }],
        });
        assert!(parse_completion(&body).is_err());
    }

    #[test]
    fn test_delta_extraction_skips_empty() {
        let chunk = serde_json::json!({
            "choices": [{"delta": {"content": "Hel"}, "finish_reason": null}]
        });
        assert_eq!(delta_text(&chunk).as_deref(), Some("Hel"));

        let finish = serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}]
        });
        assert_eq!(delta_text(&finish), None);

        let empty = serde_json::json!({
            "choices": [{"delta": {"content": ""}}]
        });
        assert_eq!(delta_text(&empty), None);
    }
}
