//! Canonical message and content-part data model.
//!
//! A [`Message`] is the single unit of conversation exchanged between agents
//! and the one shape that crosses the wire: inbound requests, outbound
//! replies, and streamed chunks all decode into it.  Content lives in an
//! ordered, non-empty list of [`Part`]s — plain text, a file reference, or an
//! opaque JSON payload — discriminated by their `kind` tag.
//!
//! # Example
//!
//! ```rust
//! use agentkit::message::{Message, Role};
//!
//! let msg = Message::user_text("hi there");
//! assert_eq!(msg.text(), "hi there");
//! assert!(msg.validate().is_ok());
//!
//! let reply = Message::agent_text("hello!").with_context_id("conv-1");
//! assert!(matches!(reply.role, Role::Agent));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agentkit::error::{AgentError, Result};

/// Default value for [`Message::kind`].
pub const MESSAGE_KIND: &str = "message";

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human or calling-agent authored message.
    User,
    /// A message produced by this agent (the assistant side).
    Agent,
    /// A priming message that constrains agent behaviour.
    System,
    /// A tool-result message correlating with a prior tool call.
    Tool,
}

impl Role {
    /// Lowercase wire name for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File payload carried by a [`Part::File`].  Exactly one of `bytes`
/// (base64-encoded inline content) or `uri` must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// Original file name, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type such as `application/pdf`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Base64-encoded inline bytes.  Mutually exclusive with `uri`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    /// Location of the file content.  Mutually exclusive with `bytes`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl FileContent {
    /// Check the bytes/uri exclusivity invariant.
    pub fn validate(&self) -> Result<()> {
        match (&self.bytes, &self.uri) {
            (Some(_), Some(_)) => Err(AgentError::invalid_input(
                "file part must carry bytes or uri, not both",
            )),
            (None, None) => Err(AgentError::invalid_input(
                "file part must carry bytes or a uri",
            )),
            _ => Ok(()),
        }
    }
}

/// One content unit inside a [`Message`].  The serialized form is
/// discriminated by its `kind` field; unknown kinds are rejected at decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    /// Plain text.
    Text {
        /// The text body.
        text: String,
    },
    /// A file, inline or by reference.
    File {
        /// The file descriptor.
        file: FileContent,
    },
    /// An opaque structured payload.
    Data {
        /// Arbitrary JSON object.
        data: Value,
    },
}

impl Part {
    /// Build a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Build a data part.
    pub fn data(data: Value) -> Self {
        Part::Data { data }
    }

    /// The text body if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single unit of conversation.
///
/// Identifiers are opaque strings; `message_id` must be unique within a
/// session, and the optional `context_id` groups messages into one
/// conversation.  `metadata` is an open string-to-JSON map used by
/// middleware and the protocol layer (the authenticated protocol stores its
/// signature envelope there).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for this message.
    pub message_id: String,
    /// Who authored the message.
    pub role: Role,
    /// Ordered, non-empty content parts.
    pub parts: Vec<Part>,
    /// Conversation grouping identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Task this message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Other tasks referenced by this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_task_ids: Vec<String>,
    /// Wire discriminator, `"message"` unless a future envelope says otherwise.
    #[serde(default = "default_message_kind")]
    pub kind: String,
    /// Open metadata map.  Values must be JSON-serializable, which the
    /// representation guarantees.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Creation timestamp, if the producer recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_message_kind() -> String {
    MESSAGE_KIND.to_string()
}

impl Message {
    /// Build a message with a fresh id and the given role and parts.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Message {
            message_id: Uuid::new_v4().to_string(),
            role,
            parts,
            context_id: None,
            task_id: None,
            reference_task_ids: Vec::new(),
            kind: MESSAGE_KIND.to_string(),
            metadata: Map::new(),
            created_at: Some(Utc::now()),
        }
    }

    /// Build a user message with one text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::new(Role::User, vec![Part::text(text)])
    }

    /// Build an agent message with one text part.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Message::new(Role::Agent, vec![Part::text(text)])
    }

    /// Build a system message with one text part.
    pub fn system_text(text: impl Into<String>) -> Self {
        Message::new(Role::System, vec![Part::text(text)])
    }

    /// Set the message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    /// Set the conversation context id.
    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Set the task id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Insert a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenation of all text parts, in order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Check the message invariants: non-empty id, non-empty parts,
    /// non-empty kind, and well-formed file parts.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.is_empty() {
            return Err(AgentError::invalid_input("message id must not be empty"));
        }
        if self.parts.is_empty() {
            return Err(AgentError::invalid_input(
                "message must carry at least one part",
            ));
        }
        if self.kind.is_empty() {
            return Err(AgentError::invalid_input("message kind must not be empty"));
        }
        for part in &self.parts {
            if let Part::File { file } = part {
                file.validate()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_is_identity() {
        let msg = Message::user_text("hello")
            .with_id("m1")
            .with_context_id("ctx-9")
            .with_task_id("t-3")
            .with_metadata("trace", json!({"hop": 2}));
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let msg = Message::user_text("hi").with_id("m1").with_context_id("c1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["messageId"], "m1");
        assert_eq!(value["contextId"], "c1");
        assert_eq!(value["role"], "user");
        assert_eq!(value["kind"], "message");
        assert_eq!(value["parts"][0]["kind"], "text");
        assert_eq!(value["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_agent_role_serializes_as_agent() {
        let value = serde_json::to_value(Role::Agent).unwrap();
        assert_eq!(value, json!("agent"));
    }

    #[test]
    fn test_kind_defaults_when_absent() {
        let msg: Message = serde_json::from_value(json!({
            "messageId": "m1",
            "role": "user",
            "parts": [{"kind": "text", "text": "hi"}],
        }))
        .unwrap();
        assert_eq!(msg.kind, MESSAGE_KIND);
    }

    #[test]
    fn test_unknown_part_kind_rejected() {
        let result: std::result::Result<Part, _> =
            serde_json::from_value(json!({"kind": "video", "url": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_text_concatenates_parts_in_order() {
        let msg = Message::new(
            Role::User,
            vec![
                Part::text("Hello"),
                Part::data(json!({"k": 1})),
                Part::text(", "),
                Part::text("world"),
            ],
        );
        assert_eq!(msg.text(), "Hello, world");
    }

    #[test]
    fn test_validate_rejects_empty_id_and_parts() {
        let mut msg = Message::user_text("hi");
        msg.message_id = String::new();
        assert!(msg.validate().is_err());

        let mut msg = Message::user_text("hi");
        msg.parts.clear();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_file_part_requires_exactly_one_source() {
        let both = FileContent {
            name: Some("a.txt".into()),
            mime_type: Some("text/plain".into()),
            bytes: Some("aGVsbG8=".into()),
            uri: Some("https://example.com/a.txt".into()),
        };
        assert!(both.validate().is_err());

        let neither = FileContent {
            name: None,
            mime_type: None,
            bytes: None,
            uri: None,
        };
        assert!(neither.validate().is_err());

        let uri_only = FileContent {
            name: None,
            mime_type: None,
            bytes: None,
            uri: Some("https://example.com/a.txt".into()),
        };
        assert!(uri_only.validate().is_ok());
    }
}
