//! HTTP surface of the runtime.
//!
//! Two endpoints, both POST: `/v1/messages` answers with a JSON reply
//! message, `/v1/messages/stream` answers with Server-Sent Events
//! (`message` events carrying JSON messages, a terminal `done`, or a
//! terminal `error`).  The `X-Protocol-Mode` header carries the caller's
//! protocol hint; an unparseable hint is rejected up front.
//!
//! Errors leave as `{"error": <kind>, "message": <human>}` with the status
//! code mapped from the error kind.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream;
use log::debug;

use crate::agentkit::agent::Dispatcher;
use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Message;
use crate::agentkit::protocol::{ProtocolMode, PROTOCOL_MODE_HEADER};

/// Assemble the router for a runtime's dispatch core.
pub(crate) fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/v1/messages", post(post_message))
        .route("/v1/messages/stream", post(post_message_stream))
        .with_state(dispatcher)
}

fn protocol_hint(headers: &HeaderMap) -> Result<Option<ProtocolMode>> {
    match headers.get(PROTOCOL_MODE_HEADER) {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().map_err(|_| {
                AgentError::invalid_input("X-Protocol-Mode header is not valid text")
            })?;
            ProtocolMode::parse(value).map(Some)
        }
    }
}

fn decode_message(body: &Bytes) -> Result<Message> {
    serde_json::from_slice::<Message>(body)
        .map_err(|err| AgentError::invalid_input(format!("malformed message body: {err}")))
}

fn error_response(err: &AgentError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_wire())).into_response()
}

async fn post_message(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = async {
        let hint = protocol_hint(&headers)?;
        let message = decode_message(&body)?;
        dispatcher.dispatch_with_hint(message, hint).await
    }
    .await;

    match outcome {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => {
            debug!("request failed: {err}");
            error_response(&err)
        }
    }
}

async fn post_message_stream(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let outcome = async {
        let hint = protocol_hint(&headers)?;
        let message = decode_message(&body)?;
        dispatcher.dispatch_with_hint(message, hint).await
    }
    .await;

    let events = match outcome {
        Ok(reply) => {
            let data = serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_string());
            vec![
                Event::default().event("message").data(data),
                Event::default().event("done").data("[DONE]"),
            ]
        }
        Err(err) => {
            debug!("stream request failed: {err}");
            let data =
                serde_json::to_string(&err.to_wire()).unwrap_or_else(|_| "{}".to_string());
            vec![Event::default().event("error").data(data)]
        }
    };

    Sse::new(stream::iter(events.into_iter().map(Ok)))
}
