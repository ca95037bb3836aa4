//! Anthropic Claude adapter.
//!
//! The Messages API differs from the OpenAI-compatible shape in three ways
//! this adapter absorbs: the system prompt travels in a dedicated `system`
//! field instead of the message list, `max_tokens` is mandatory (a default
//! of 4096 is applied when the request leaves it unset), and streaming
//! deltas arrive as typed events (`content_block_delta`) rather than chat
//! chunks.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Role;
use crate::agentkit::provider::{
    CompletionRequest, CompletionResponse, Provider, StreamSink, ToolCall, ToolChoice, Usage,
};
use crate::agentkit::providers::common::{check_status, env_var, for_each_sse_event};
use crate::agentkit::providers::http_pool::get_http_client;

/// Default model applied when neither the request nor the configuration
/// names one.
pub const DEFAULT_MODEL: &str = "claude-3-sonnet-20240229";

/// Default API base URL, without a trailing slash.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";

/// Environment variable overriding the default model.
pub const ENV_MODEL: &str = "ANTHROPIC_MODEL";

/// `max_tokens` applied when the request does not set one; the API rejects
/// requests without it.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

const API_VERSION: &str = "2023-06-01";

/// Claude model identifiers (early-2024 snapshot).
pub enum Model {
    /// `claude-3-opus-20240229` – strongest reasoning tier.
    Claude3Opus,
    /// `claude-3-sonnet-20240229` – balanced reasoning and throughput.
    Claude3Sonnet,
    /// `claude-3-haiku-20240307` – fastest tier.
    Claude3Haiku,
}

/// Convert a [`Model`] variant into the string identifier the API expects.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::Claude3Opus => "claude-3-opus-20240229",
        Model::Claude3Sonnet => "claude-3-sonnet-20240229",
        Model::Claude3Haiku => "claude-3-haiku-20240307",
    }
    .to_string()
}

/// Adapter for Anthropic's Messages API.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a provider with an explicit model name.
    pub fn new(api_key: &str, model: &str) -> Self {
        let base_url = DEFAULT_BASE_URL;
        AnthropicProvider {
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

    /// Point the adapter at a different host (proxies, test doubles).  The
    /// base URL should not carry a trailing slash.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let normalized = base_url.trim_end_matches('/');
        self.base_url = normalized.to_string();
        self.client = get_http_client(normalized);
        self
    }

    /// Construct from `ANTHROPIC_API_KEY` and optional `ANTHROPIC_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = env_var(ENV_API_KEY)
            .ok_or_else(|| AgentError::invalid_input(format!("{ENV_API_KEY} is not set")))?;
        let model = env_var(ENV_MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self::new(&api_key, &model))
    }

    fn resolve_model(&self, request: &CompletionRequest) -> String {
        request.model.clone().unwrap_or_else(|| self.model.clone())
    }

    /// Build the request payload.  System turns are collected into the
    /// dedicated `system` field; everything else alternates user/assistant.
    fn build_payload(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(&message.content),
                Role::Agent => {
                    messages.push(json!({"role": "assistant", "content": message.content}))
                }
                // Tool results have no first-class lane here; they ride as
                // user turns so the conversation stays alternating.
                Role::User | Role::Tool => {
                    messages.push(json!({"role": "user", "content": message.content}))
                }
            }
        }

        let mut payload = json!({
            "model": self.resolve_model(request),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n\n"));
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
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
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

    async fn post_messages(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(payload)
            .send()
            .await?;
        check_status("anthropic", response).await
    }
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::Function(name) => json!({"type": "tool", "name": name}),
    }
}

/// Parse a non-streaming Messages body into the uniform response.  Text
/// blocks concatenate into `content`; `tool_use` blocks become tool calls
/// with their input re-encoded as the argument string.
fn parse_completion(value: &Value) -> Result<CompletionResponse> {
    let blocks = value["content"]
        .as_array()
        .ok_or_else(|| AgentError::internal("anthropic: response carries no content"))?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => {
                let call = ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].to_string(),
                };
                call.parsed_arguments()?;
                tool_calls.push(call);
            }
            _ => {}
        }
    }

    let prompt = value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
    let completion = value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(CompletionResponse {
        id: value["id"].as_str().unwrap_or_default().to_string(),
        model: value["model"].as_str().unwrap_or_default().to_string(),
        content,
        finish_reason: value["stop_reason"].as_str().map(|s| s.to_string()),
        usage: Usage::new(prompt, completion),
        tool_calls,
    })
}

/// Extract the text delta from one streaming event, if it carries any.
fn delta_text(value: &Value) -> Option<String> {
    if value["type"].as_str() != Some("content_block_delta") {
        return None;
    }
    value["delta"]["text"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        request.validate()?;
        let payload = self.build_payload(&request, false);
        let response = self.post_messages(&payload).await?;
        let body: Value = response.json().await?;
        parse_completion(&body)
    }

    async fn stream(&self, request: CompletionRequest, sink: StreamSink<'_>) -> Result<()> {
        request.validate()?;
        let payload = self.build_payload(&request, true);
        let response = self.post_messages(&payload).await?;
        for_each_sse_event(response, |event| {
            if event.event.as_deref() == Some("message_stop") {
                return Ok(false);
            }
            let value: Value = match serde_json::from_str(&event.data) {
                Ok(value) => value,
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
    use crate::agentkit::provider::ChatMessage;

    #[test]
    fn test_system_messages_move_to_system_field() {
        let provider = AnthropicProvider::new("k", DEFAULT_MODEL);
        let req = CompletionRequest::new(vec![
            ChatMessage::new(Role::System, "be terse"),
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Agent, "hello"),
        ]);
        let payload = provider.build_payload(&req, false);
        assert_eq!(payload["system"], "be terse");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 2);
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][1]["role"], "assistant");
    }

    #[test]
    fn test_max_tokens_defaults_when_unset() {
        let provider = AnthropicProvider::new("k", DEFAULT_MODEL);
        let req = CompletionRequest::new(vec![ChatMessage::new(Role::User, "hi")]);
        let payload = provider.build_payload(&req, false);
        assert_eq!(payload["max_tokens"], DEFAULT_MAX_TOKENS);

        let payload = provider.build_payload(&req.clone().with_max_tokens(256), false);
        assert_eq!(payload["max_tokens"], 256);
    }

    #[test]
    fn test_required_tool_choice_maps_to_any() {
        assert_eq!(tool_choice_value(&ToolChoice::Required)["type"], "any");
        assert_eq!(
            tool_choice_value(&ToolChoice::Function("calc".into()))["name"],
            "calc"
        );
    }

    #[test]
    fn test_parse_completion_concatenates_text_blocks() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3-sonnet-20240229",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": ", world"},
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4},
        });
        let response = parse_completion(&body).unwrap();
        assert_eq!(response.content, "Hello, world");
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage.total_tokens, 16);
    }

    #[test]
    fn test_parse_tool_use_block() {
        let body = json!({
            "id": "msg_2",
            "model": "claude-3-opus-20240229",
            "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "calc", "input": {"x": 2}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1},
        });
        let response = parse_completion(&body).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(
            response.tool_calls[0].parsed_arguments().unwrap()["x"],
            2
        );
    }

    #[test]
    fn test_delta_extraction() {
        let delta = json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "Hel"},
        });
        assert_eq!(delta_text(&delta).as_deref(), Some("Hel"));

        let start = json!({"type": "message_start", "message": {}});
        assert_eq!(delta_text(&start), None);
    }
}
