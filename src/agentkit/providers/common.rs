//! Shared utilities used across provider adapters.
//!
//! The helpers here cover the three concerns every adapter repeats: mapping
//! remote HTTP failures into the crate's error taxonomy, walking an SSE
//! response body event by event, and translating [`Role`]s into the wire
//! names chat APIs expect.

use futures_util::StreamExt;
use serde_json::Value;

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Role;
use crate::agentkit::sse::{SseEvent, SseParser};

/// Wire role name used by chat-completion APIs.  The agent side of a
/// conversation is `"assistant"` on every provider wire even though the
/// canonical message model calls it `agent`.
pub fn provider_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Agent => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

/// Pull a human-readable error message out of a provider error body.
/// The three supported services all nest it under `error.message`; a few
/// error shapes put it at the top level.
fn remote_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["message"]
        .as_str()
        .or_else(|| value["message"].as_str())
        .map(|s| s.to_string())
}

/// Map a non-success provider response to the error taxonomy:
/// 401/403 → unauthorized, 404 → not-found, 429 → rate-limit-exceeded,
/// 5xx → unavailable; anything else carries the remote message when the
/// body yields one, and falls back to an internal error with the status.
pub fn map_status_error(provider: &str, status: u16, body: &str) -> AgentError {
    match status {
        401 | 403 => AgentError::unauthorized(format!("{provider}: invalid API key")),
        404 => AgentError::not_found(format!("{provider}: unknown endpoint or model")),
        429 => AgentError::rate_limited(format!("{provider}: remote rate limit")),
        500..=599 => AgentError::unavailable(format!("{provider}: upstream returned {status}")),
        _ => match remote_error_message(body) {
            Some(message) => AgentError::invalid_input(format!("{provider}: {message}")),
            None => AgentError::internal(format!("{provider}: unexpected status {status}")),
        },
    }
}

/// Check a provider response, consuming it into an error when the status is
/// not a success.
pub async fn check_status(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(map_status_error(provider, code, &body))
}

/// Walk an SSE response body, invoking `handle` once per parsed event in
/// arrival order.  The walk ends when the stream is exhausted, when a done
/// sentinel arrives, when `handle` returns `Ok(false)`, or with the error
/// `handle` raised.  Transport failures mid-stream are returned as
/// unavailable errors; events already handed out stay handed out.
pub async fn for_each_sse_event<F>(response: reqwest::Response, mut handle: F) -> Result<()>
where
    F: FnMut(SseEvent) -> Result<bool> + Send,
{
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(AgentError::from)?;
        let text = String::from_utf8_lossy(&chunk);
        for event in parser.feed(&text) {
            if event.is_done() {
                return Ok(());
            }
            if !handle(event)? {
                return Ok(());
            }
        }
    }
    if let Some(event) = parser.finish() {
        if !event.is_done() {
            handle(event)?;
        }
    }
    Ok(())
}

/// Read an environment variable, treating empty values as unset.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
