//! Client SDK for agent-to-agent calls.
//!
//! The symmetric counterpart of the server surface: JSON POST to a peer's
//! `/v1/messages` for request/reply, SSE consumption from
//! `/v1/messages/stream` for incremental replies.  Request/reply calls
//! retry transient failures with exponential backoff; invalid-input and
//! unauthorized failures abort immediately.  When the client is configured
//! for the authenticated protocol it signs every outbound message and
//! advertises the mode through the `X-Protocol-Mode` header.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentkit::client::AgentClient;
//! use agentkit::message::Message;
//!
//! # async fn demo() -> agentkit::error::Result<()> {
//! let client = AgentClient::new("http://localhost:8080");
//! let reply = client.send_message(Message::user_text("hello over there")).await?;
//! println!("peer said: {}", reply.text());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use futures_util::StreamExt;
use log::debug;
use tokio::sync::mpsc;

use crate::agentkit::error::{AgentError, ErrorBody, Result};
use crate::agentkit::message::Message;
use crate::agentkit::protocol::{
    sign_message, ProtocolMode, SageConfig, SigningKey, PROTOCOL_MODE_HEADER,
};
use crate::agentkit::providers::http_pool::build_pooled_client;
use crate::agentkit::retry::{retry_with_backoff, RetryConfig};
use crate::agentkit::sse::SseParser;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One item received from a reply stream.
#[derive(Debug)]
pub enum StreamChunk {
    /// A reply message (or incremental piece of one).
    Message(Message),
    /// A terminal error; the channel closes right after.
    Error(AgentError),
}

/// Client for calling a peer agent.
pub struct AgentClient {
    base_url: String,
    timeout: Duration,
    protocol: ProtocolMode,
    retry: RetryConfig,
    identity: Option<(SageConfig, SigningKey)>,
    http: reqwest::Client,
}

impl AgentClient {
    /// Create a client for the peer at `base_url` (scheme + authority,
    /// no trailing slash required).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        AgentClient {
            base_url,
            timeout: DEFAULT_TIMEOUT,
            protocol: ProtocolMode::Auto,
            retry: RetryConfig::default(),
            identity: None,
            http: build_pooled_client(),
        }
    }

    /// Per-request timeout (default 30 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Outbound protocol mode (default auto).
    pub fn with_protocol(mut self, protocol: ProtocolMode) -> Self {
        self.protocol = protocol;
        self
    }

    /// Retry policy for request/reply calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sign outbound messages as this identity.  Implies that peers running
    /// the authenticated protocol will accept the messages.
    pub fn with_identity(mut self, config: SageConfig, key: SigningKey) -> Self {
        self.identity = Some((config, key));
        self
    }

    /// Sign the message when an identity is configured and the protocol is
    /// not pinned to plaintext.
    fn prepare(&self, message: Message) -> Message {
        match (&self.identity, self.protocol) {
            (Some(_), ProtocolMode::A2a) | (None, _) => message,
            (Some((config, key)), _) => sign_message(message, config, key),
        }
    }

    /// Send a message and await the single reply, retrying transient
    /// failures per the configured policy.
    pub async fn send_message(&self, message: Message) -> Result<Message> {
        let message = self.prepare(message);
        retry_with_backoff(&self.retry, || self.post_once(&message)).await
    }

    async fn post_once(&self, message: &Message) -> Result<Message> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header(PROTOCOL_MODE_HEADER, self.protocol.as_str())
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Message>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(wire_error(status.as_u16(), &body))
    }

    /// Send a message and stream the reply.
    ///
    /// The returned channel yields [`StreamChunk`]s in arrival order and
    /// closes when the stream ends — normally, after a terminal error
    /// chunk, or when the receiver is dropped (which cancels the read and
    /// stops the background task; nothing leaks).
    pub async fn stream_message(&self, message: Message) -> Result<mpsc::Receiver<StreamChunk>> {
        let message = self.prepare(message);
        let url = format!("{}/v1/messages/stream", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header(PROTOCOL_MODE_HEADER, self.protocol.as_str())
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(wire_error(status.as_u16(), &body));
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(read_stream(response, tx));
        Ok(rx)
    }
}

/// Decode a non-success response body into an error, preferring the wire
/// kind over the bare status code.
fn wire_error(status: u16, body: &str) -> AgentError {
    if let Ok(wire) = serde_json::from_str::<ErrorBody>(body) {
        return AgentError::from_wire_kind(&wire.error, wire.message);
    }
    match status {
        400 => AgentError::invalid_input(format!("peer rejected request ({status})")),
        401 => AgentError::unauthorized(format!("peer rejected credentials ({status})")),
        404 => AgentError::not_found(format!("peer endpoint missing ({status})")),
        429 => AgentError::rate_limited(format!("peer rate limited ({status})")),
        504 => AgentError::timeout(format!("peer timed out ({status})")),
        _ => AgentError::unavailable(format!("peer returned status {status}")),
    }
}

/// Background reader: parse SSE frames off the body and forward chunks
/// until done, error, disconnect, or receiver drop.
async fn read_stream(response: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("stream receiver dropped, abandoning read");
                return;
            }
            chunk = body.next() => match chunk {
                None => return,
                Some(Err(err)) => {
                    let _ = tx.send(StreamChunk::Error(err.into())).await;
                    return;
                }
                Some(Ok(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for event in parser.feed(&text) {
                        if event.is_done() {
                            return;
                        }
                        if !forward_event(&event.event, &event.data, &tx).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Forward one SSE event as a chunk.  Returns false when the stream should
/// end (terminal error or closed receiver).
async fn forward_event(
    event: &Option<String>,
    data: &str,
    tx: &mpsc::Sender<StreamChunk>,
) -> bool {
    // Empty deltas carry nothing; skip them.
    if data.is_empty() {
        return true;
    }
    match event.as_deref() {
        Some("error") => {
            let err = match serde_json::from_str::<ErrorBody>(data) {
                Ok(wire) => AgentError::from_wire_kind(&wire.error, wire.message),
                Err(_) => AgentError::internal(format!("peer stream error: {data}")),
            };
            let _ = tx.send(StreamChunk::Error(err)).await;
            false
        }
        Some("message") | None => match serde_json::from_str::<Message>(data) {
            Ok(message) => tx.send(StreamChunk::Message(message)).await.is_ok(),
            Err(err) => {
                let _ = tx
                    .send(StreamChunk::Error(AgentError::invalid_input(format!(
                        "undecodable stream message: {err}"
                    ))))
                    .await;
                false
            }
        },
        // Unknown event types are ignored per the closed-set contract.
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_prefers_body_kind() {
        let body = r#"{"error": "rate_limit_exceeded", "message": "slow down"}"#;
        let err = wire_error(429, body);
        assert_eq!(err.kind(), "rate_limit_exceeded");
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn test_wire_error_falls_back_to_status() {
        assert_eq!(wire_error(503, "<html>").kind(), "unavailable");
        assert_eq!(wire_error(401, "").kind(), "unauthorized");
        assert_eq!(wire_error(504, "").kind(), "timeout");
    }

    #[test]
    fn test_prepare_signs_only_with_identity() {
        let plain = AgentClient::new("http://peer");
        let message = plain.prepare(Message::user_text("hi"));
        assert!(!message.metadata.contains_key("sage"));

        let signed_client = AgentClient::new("http://peer")
            .with_protocol(ProtocolMode::Sage)
            .with_identity(
                SageConfig::new("did:sage:me"),
                SigningKey::from_secret(b"k".to_vec()),
            );
        let signed = signed_client.prepare(Message::user_text("hi"));
        assert!(signed.metadata.contains_key("sage"));
    }

    #[test]
    fn test_pinned_plaintext_never_signs() {
        let client = AgentClient::new("http://peer")
            .with_protocol(ProtocolMode::A2a)
            .with_identity(
                SageConfig::new("did:sage:me"),
                SigningKey::from_secret(b"k".to_vec()),
            );
        let message = client.prepare(Message::user_text("hi"));
        assert!(!message.metadata.contains_key("sage"));
    }
}
