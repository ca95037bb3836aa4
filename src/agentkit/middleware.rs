//! Onion-layered middleware chain.
//!
//! A [`Middleware`] maps a [`Handler`] to a [`Handler`].  The chain is
//! assembled bottom-up from the user handler leaf, so the first middleware
//! in the list wraps all later ones and runs outermost.  Despite the
//! wrapping, nothing is cyclic: each layer holds a handle to the next only.
//!
//! Assembly order matters and the builder enforces it for the built-ins:
//! recovery outermost (so every inner panic is caught), request-id before
//! logging and validation, validation before business logic, rate limiting
//! before caching (a denied request must not touch cache state), and
//! caching last before the handler so a hit short-circuits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use log::{debug, error, info};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Message;
use crate::agentkit::protocol::ProtocolMode;

/// Per-request facts resolved before the chain runs.  Middleware passes it
/// through unchanged; the leaf uses it to populate the handler context.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Protocol mode resolved for this message.
    pub protocol: ProtocolMode,
    /// Verified sender identity, set only after successful authentication.
    pub verified_identity: Option<String>,
}

/// Future returned by a chain handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Message>> + Send>>;

/// A request-to-reply function; the shape every middleware wraps.
pub type Handler = Arc<dyn Fn(RequestInfo, Message) -> HandlerFuture + Send + Sync>;

/// A function wrapping a handler with cross-cutting behavior.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Assemble a chain: the first middleware runs outermost.
pub fn compose(middlewares: &[Middleware], leaf: Handler) -> Handler {
    let mut handler = leaf;
    for middleware in middlewares.iter().rev() {
        handler = middleware(handler);
    }
    handler
}

/// Catch panics from everything it wraps and convert them into internal
/// errors.  Must be the outermost layer.
pub fn recovery_middleware() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |info: RequestInfo, message: Message| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                match std::panic::AssertUnwindSafe(next(info, message))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!("handler panicked: {detail}");
                        Err(AgentError::internal(format!("panic: {detail}")))
                    }
                }
            })
        })
    })
}

/// Emit structured begin/end records with id, role, duration, and outcome.
pub fn logger_middleware() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |info: RequestInfo, message: Message| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let id = message.message_id.clone();
                let role = message.role;
                debug!("request begin id={id} role={role}");
                let started = Instant::now();
                let result = next(info, message).await;
                let elapsed = started.elapsed();
                match &result {
                    Ok(_) => info!("request end id={id} role={role} duration={elapsed:?}"),
                    Err(err) => {
                        error!("request end id={id} role={role} duration={elapsed:?} error={err}")
                    }
                }
                result
            })
        })
    })
}

/// Assign a fresh opaque id to requests that arrive without one.
pub fn request_id_middleware() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |info: RequestInfo, mut message: Message| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                if message.message_id.is_empty() {
                    message.message_id = Uuid::new_v4().to_string();
                }
                next(info, message).await
            })
        })
    })
}

/// Record wall-clock duration into the reply metadata as `durationMs`.
pub fn timer_middleware() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |info: RequestInfo, message: Message| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let started = Instant::now();
                let mut reply = next(info, message).await?;
                let millis = started.elapsed().as_millis() as u64;
                reply
                    .metadata
                    .insert("durationMs".to_string(), Value::from(millis));
                Ok(reply)
            })
        })
    })
}

/// Reject malformed requests before any business logic runs.
pub fn validator_middleware() -> Middleware {
    Arc::new(|next: Handler| {
        Arc::new(move |info: RequestInfo, message: Message| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                message.validate().map_err(|e| e.wrap("validator"))?;
                next(info, message).await
            })
        })
    })
}

/// Inject a fixed name→value map into every reply's metadata.  Existing
/// reply keys win over injected ones.
pub fn metadata_middleware(entries: Map<String, Value>) -> Middleware {
    Arc::new(move |next: Handler| {
        let entries = entries.clone();
        Arc::new(move |info: RequestInfo, message: Message| {
            let entries = entries.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                let mut reply = next(info, message).await?;
                for (key, value) in entries {
                    reply.metadata.entry(key).or_insert(value);
                }
                Ok(reply)
            })
        })
    })
}

/// Impose a deadline on everything it wraps.  Expiry yields a timeout
/// error, distinct from caller cancellation.
pub fn timeout_middleware(deadline: Duration) -> Middleware {
    Arc::new(move |next: Handler| {
        Arc::new(move |info: RequestInfo, message: Message| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                match tokio::time::timeout(deadline, next(info, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::timeout(format!(
                        "request exceeded {deadline:?}"
                    ))),
                }
            })
        })
    })
}

/// Predicate over the request's concatenated text; `false` rejects.
pub type ContentPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Reject requests whose concatenated text fails the predicate.
pub fn content_filter_middleware(predicate: ContentPredicate) -> Middleware {
    Arc::new(move |next: Handler| {
        let predicate = Arc::clone(&predicate);
        Arc::new(move |info: RequestInfo, message: Message| {
            let predicate = Arc::clone(&predicate);
            let next = Arc::clone(&next);
            Box::pin(async move {
                if !predicate(&message.text()) {
                    return Err(
                        AgentError::invalid_input("message rejected by content filter")
                            .wrap("content filter"),
                    );
                }
                next(info, message).await
            })
        })
    })
}
