//! Google Gemini adapter.
//!
//! Talks to the Generative Language API.  Gemini authenticates with a
//! `key` query parameter rather than a bearer header, names its roles
//! `user`/`model`, and takes the system prompt as a separate
//! `systemInstruction` block.  Streaming uses the same endpoint with
//! `:streamGenerateContent?alt=sse`, which frames candidates as SSE data
//! events.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Role;
use crate::agentkit::provider::{
    CompletionRequest, CompletionResponse, Provider, StreamSink, Usage,
};
use crate::agentkit::providers::common::{check_status, env_var, for_each_sse_event};
use crate::agentkit::providers::http_pool::get_http_client;

/// Default model applied when neither the request nor the configuration
/// names one.
pub const DEFAULT_MODEL: &str = "gemini-pro";

/// Default API base URL, without a trailing slash.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "GEMINI_API_KEY";

/// Fallback environment variable for the API key.
pub const ENV_API_KEY_FALLBACK: &str = "GOOGLE_API_KEY";

/// Environment variable overriding the default model.
pub const ENV_MODEL: &str = "GEMINI_MODEL";

/// Adapter for Google's Generative Language (Gemini) API.
pub struct GeminiProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    /// Create a provider with an explicit model name.
    pub fn new(api_key: &str, model: &str) -> Self {
        let base_url = DEFAULT_BASE_URL;
        GeminiProvider {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            client: get_http_client(base_url),
        }
    }

    /// Point the adapter at a different host (proxies, test doubles).  The
    /// base URL should not carry a trailing slash.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let normalized = base_url.trim_end_matches('/');
        self.base_url = normalized.to_string();
        self.client = get_http_client(normalized);
        self
    }

    /// Construct from `GEMINI_API_KEY` (falling back to `GOOGLE_API_KEY`)
    /// and optional `GEMINI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = env_var(ENV_API_KEY)
            .or_else(|| env_var(ENV_API_KEY_FALLBACK))
            .ok_or_else(|| {
                AgentError::invalid_input(format!(
                    "neither {ENV_API_KEY} nor {ENV_API_KEY_FALLBACK} is set"
                ))
            })?;
        let model = env_var(ENV_MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self::new(&api_key, &model))
    }

    fn resolve_model(&self, request: &CompletionRequest) -> String {
        request.model.clone().unwrap_or_else(|| self.model.clone())
    }

    /// Build the request payload.  System turns become the
    /// `systemInstruction`; the rest map onto `user`/`model` contents.
    fn build_payload(&self, request: &CompletionRequest) -> Value {
        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(json!({"text": message.content})),
                Role::Agent => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": message.content}],
                })),
                Role::User | Role::Tool => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": message.content}],
                })),
            }
        }

        let mut payload = json!({"contents": contents});
        if !system_parts.is_empty() {
            payload["systemInstruction"] = json!({"parts": system_parts});
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }
        payload
    }

    async fn post_generate(
        &self,
        model: &str,
        payload: &Value,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, model, self.api_key
            )
        } else {
            format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, model, self.api_key
            )
        };
        let response = self.client.post(&url).json(payload).send().await?;
        check_status("gemini", response).await
    }
}

/// Join the text parts of the first candidate.
fn candidate_text(value: &Value) -> String {
    value["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Parse a non-streaming generateContent body into the uniform response.
fn parse_completion(value: &Value, model: &str) -> Result<CompletionResponse> {
    if value["candidates"].as_array().map_or(true, |c| c.is_empty()) {
        return Err(AgentError::internal("gemini: response carries no candidates"));
    }
    let prompt = value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32;
    let completion = value["usageMetadata"]["candidatesTokenCount"]
        .as_u64()
        .unwrap_or(0) as u32;

    Ok(CompletionResponse {
        id: value["responseId"].as_str().unwrap_or_default().to_string(),
        model: model.to_string(),
        content: candidate_text(value),
        finish_reason: value["candidates"][0]["finishReason"]
            .as_str()
            .map(|s| s.to_string()),
        usage: Usage::new(prompt, completion),
        tool_calls: Vec::new(),
    })
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        request.validate()?;
        let model = self.resolve_model(&request);
        let payload = self.build_payload(&request);
        let response = self.post_generate(&model, &payload, false).await?;
        let body: Value = response.json().await?;
        parse_completion(&body, &model)
    }

    async fn stream(&self, request: CompletionRequest, sink: StreamSink<'_>) -> Result<()> {
        request.validate()?;
        let model = self.resolve_model(&request);
        let payload = self.build_payload(&request);
        let response = self.post_generate(&model, &payload, true).await?;
        for_each_sse_event(response, |event| {
            let value: Value = match serde_json::from_str(&event.data) {
                Ok(value) => value,
                Err(_) => return Ok(true),
            };
            let delta = candidate_text(&value);
            if !delta.is_empty() {
                sink(&delta)?;
            }
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentkit::provider::ChatMessage;

    #[test]
    fn test_payload_roles_and_system_instruction() {
        let provider = GeminiProvider::new("k", DEFAULT_MODEL);
        let req = CompletionRequest::new(vec![
            ChatMessage::new(Role::System, "be terse"),
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Agent, "hello"),
        ]);
        let payload = provider.build_payload(&req);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["contents"][1]["role"], "model");
    }

    #[test]
    fn test_generation_config_only_when_set() {
        let provider = GeminiProvider::new("k", DEFAULT_MODEL);
        let bare = provider.build_payload(&CompletionRequest::new(vec![ChatMessage::new(
            Role::User,
            "hi",
        )]));
        assert!(bare.get("generationConfig").is_none());

        let tuned = provider.build_payload(
            &CompletionRequest::new(vec![ChatMessage::new(Role::User, "hi")])
                .with_max_tokens(128)
                .with_temperature(0.0),
        );
        assert_eq!(tuned["generationConfig"]["maxOutputTokens"], 128);
        assert_eq!(tuned["generationConfig"]["temperature"], 0.0);
    }

    #[test]
    fn test_parse_completion_joins_parts() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"text": "Hello"}, {"text": " world"}], "role": "model"},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7},
        });
        let response = parse_completion(&body, "gemini-pro").unwrap();
        assert_eq!(response.content, "Hello world");
        assert_eq!(response.model, "gemini-pro");
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[test]
    fn test_empty_candidates_is_an_error() {
        let body = json!({"candidates": []});
        assert!(parse_completion(&body, "gemini-pro").is_err());
    }
}
