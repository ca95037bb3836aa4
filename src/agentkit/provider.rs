//! Shared primitives for provider-agnostic LLM access.
//!
//! Handlers interact with remote chat-completion services through the
//! [`Provider`] trait and the lightweight request/response types in this
//! module.  The trait abstracts over concrete vendor adapters (see
//! [`providers`](crate::agentkit::providers)) while [`ProviderRegistry`]
//! holds the named set an agent was built with plus an optional default.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use agentkit::provider::{ChatMessage, CompletionRequest, Provider};
//! use agentkit::providers::openai::OpenAIProvider;
//! use agentkit::message::Role;
//!
//! # async fn demo() -> agentkit::error::Result<()> {
//! let provider = OpenAIProvider::from_env()?;
//! let response = provider
//!     .complete(CompletionRequest::new(vec![ChatMessage::new(
//!         Role::User,
//!         "Who are you?",
//!     )]))
//!     .await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Role;
use crate::agentkit::tokens;

/// One turn of conversation history sent to a provider.  Content is plain
/// text; multipart messages are flattened before they reach this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the turn.
    pub role: Role,
    /// Plain-text body.
    pub content: String,
}

impl ChatMessage {
    /// Build a chat message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }
}

/// Tool-choice directive accompanying a tool-carrying request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model must not call any tool.
    None,
    /// The model may choose between text and tool calls.
    #[default]
    Auto,
    /// The model must call at least one tool.
    Required,
    /// The model must call this specific tool.
    Function(String),
}

impl ToolChoice {
    /// Parse the wire form; unknown values are invalid input.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Required),
            other => Err(AgentError::invalid_input(format!(
                "unknown tool choice {other:?} (use none, auto, or required)"
            ))),
        }
    }
}

/// JSON-schema-shaped property description.  Objects nest `properties`,
/// arrays carry an `items` schema, and strings may enumerate their values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertySchema {
    /// Schema type: `"string"`, `"number"`, `"object"`, `"array"`, ...
    #[serde(rename = "type")]
    pub schema_type: String,
    /// Human-readable description surfaced to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed values for string properties.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    /// Element schema for array properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    /// Nested properties for object properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    /// Required nested property names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

/// Parameter block of a [`ToolDefinition`]; always an object schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Schema type, conventionally `"object"`.
    #[serde(rename = "type")]
    pub schema_type: String,
    /// Named parameter schemas.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    /// Names of required parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        ParameterSchema {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// A tool the model may call, in provider-neutral shape.  Each adapter
/// translates this into its native `tools` representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear to the model.
    pub name: String,
    /// Description that helps the model decide when to call the tool.
    pub description: String,
    /// Accepted parameters.
    pub parameters: ParameterSchema,
}

/// A single tool call returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id used to correlate the eventual result.
    pub id: String,
    /// Name of the tool the model wants invoked.
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl ToolCall {
    /// Decode the argument string.  The payload must parse into a JSON
    /// object; anything else is invalid input.
    pub fn parsed_arguments(&self) -> Result<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(AgentError::invalid_input(format!(
                "tool call {} arguments are not a JSON object",
                self.name
            ))),
            Err(err) => Err(AgentError::invalid_input(format!(
                "tool call {} arguments are not valid JSON: {err}",
                self.name
            ))),
        }
    }
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt/input tokens billed by the provider.
    pub prompt_tokens: u32,
    /// Generated/output tokens billed by the provider.
    pub completion_tokens: u32,
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    pub total_tokens: u32,
}

impl Usage {
    /// Build a usage triple, computing the total from the two halves.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Input to a chat completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Model override.  `None` falls back to the provider's configured
    /// model, then to the provider family default.
    pub model: Option<String>,
    /// Ordered conversation history.
    pub messages: Vec<ChatMessage>,
    /// Upper bound on generated tokens.  Some providers require this; those
    /// adapters apply a documented default when unset.
    pub max_tokens: Option<u32>,
    /// Sampling temperature in `[0.0, 2.0]`.  `None` means "provider
    /// default"; `Some(0.0)` is honored and sent verbatim.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter in `[0.0, 1.0]`.
    pub top_p: Option<f32>,
    /// Whether this request is meant for the streaming endpoint.
    pub stream: bool,
    /// Provider-specific passthrough options.
    pub metadata: Option<Map<String, Value>>,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice directive; only meaningful when `tools` is non-empty.
    pub tool_choice: Option<ToolChoice>,
}

impl CompletionRequest {
    /// Build a request from conversation history.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        CompletionRequest {
            messages,
            ..CompletionRequest::default()
        }
    }

    /// Set the model override.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the max-output-token bound.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Attach tools and an optional choice directive.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = Some(choice);
        self
    }

    /// Basic request sanity: history non-empty, knobs in range.
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(AgentError::invalid_input(
                "completion request must carry at least one message",
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AgentError::invalid_input(format!(
                    "temperature {t} outside [0.0, 2.0]"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(AgentError::invalid_input(format!(
                    "top_p {p} outside [0.0, 1.0]"
                )));
            }
        }
        Ok(())
    }
}

/// Output of a chat completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Provider-assigned response id.
    pub id: String,
    /// Model that actually served the request.
    pub model: String,
    /// Generated text.
    pub content: String,
    /// Remote stop reason, passed through verbatim.
    pub finish_reason: Option<String>,
    /// Token accounting.
    pub usage: Usage,
    /// Tool calls the model requested, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Callback receiving streamed text deltas in arrival order.  Returning an
/// error aborts the stream immediately; that error becomes the call result.
pub type StreamSink<'a> = &'a mut (dyn FnMut(&str) -> Result<()> + Send);

/// Uniform facade over a remote chat-completion back end.
///
/// Implementations must be safe for concurrent use; a single provider
/// instance is shared across every in-flight request of the runtime.
/// Providers never retry on their own — retry policy belongs to the caller
/// or the client SDK.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider tag, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Single-shot chat completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Streaming completion.  Invokes `sink` once per text delta, in the
    /// exact order delivered by the remote.  Errors surfaced by the sink
    /// terminate the stream and are returned verbatim; transport failures
    /// after the first delivered chunk are returned without retracting
    /// already-delivered text.
    async fn stream(&self, request: CompletionRequest, sink: StreamSink<'_>) -> Result<()>;

    /// Whether [`Provider::stream`] is usable on this provider.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Whether [`Provider::complete_with_tools`] is usable.
    fn supports_function_calling(&self) -> bool {
        false
    }

    /// Chat completion with native tool calling.
    async fn complete_with_tools(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        Err(AgentError::not_implemented(format!(
            "provider {} does not support function calling",
            self.name()
        )))
    }

    /// Approximate token count for a text fragment.
    fn count_tokens(&self, text: &str) -> usize {
        tokens::estimate_tokens(text)
    }

    /// Context-window size for a model, from the static table with prefix
    /// fallback.  Unknown models get a conservative 4096.
    fn token_limit(&self, model: &str) -> usize {
        tokens::token_limit(model)
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    providers: HashMap<String, Arc<dyn Provider>>,
    default: Option<Arc<dyn Provider>>,
}

/// Named set of providers plus an optional default slot.
///
/// Safe for concurrent reads and writes.  Pass the registry to the agent
/// builder explicitly instead of holding it in a process-wide global so
/// tests stay isolated.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Register a provider under a unique name.  Re-registering a name
    /// replaces the previous entry.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.providers.insert(name.into(), provider);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::not_found(format!("provider {name:?}")))
    }

    /// Set the process-default provider handle.
    pub fn set_default(&self, provider: Arc<dyn Provider>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.default = Some(provider);
    }

    /// The default provider, if one was set.
    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.default.clone()
    }

    /// Registered provider names, unordered.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.providers.keys().cloned().collect()
    }
}
