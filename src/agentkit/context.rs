//! Per-request context handed to the user handler.
//!
//! A [`MessageContext`] bundles the inbound message with the ambient
//! handles a handler needs — storage, the configured LLM provider, and the
//! verified sender identity when the authenticated protocol was in play.
//! The handler answers by calling [`MessageContext::reply`] (or
//! [`MessageContext::reply_message`] for full control) at most once; a
//! second call is a programmer error the runtime reports as internal.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::{Message, Role};
use crate::agentkit::provider::Provider;
use crate::agentkit::storage::Storage;

/// Future returned by a user handler.
pub type AgentHandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// The user-supplied message handler.
pub type AgentHandler = Arc<dyn Fn(Arc<MessageContext>) -> AgentHandlerFuture + Send + Sync>;

/// Box an async closure into an [`AgentHandler`].
///
/// # Example
///
/// ```rust
/// use agentkit::context::handler_fn;
///
/// let handler = handler_fn(|ctx| async move {
///     let question = ctx.text();
///     ctx.reply(format!("you said: {question}"))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> AgentHandler
where
    F: Fn(Arc<MessageContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

struct ReplySlot {
    reply: Option<Message>,
    replied: bool,
}

/// Everything a handler can see and do for one request.
pub struct MessageContext {
    message: Message,
    storage: Arc<dyn Storage>,
    provider: Option<Arc<dyn Provider>>,
    verified_identity: Option<String>,
    slot: Mutex<ReplySlot>,
}

impl MessageContext {
    /// Build a context for one request.
    pub fn new(
        message: Message,
        storage: Arc<dyn Storage>,
        provider: Option<Arc<dyn Provider>>,
        verified_identity: Option<String>,
    ) -> Self {
        MessageContext {
            message,
            storage,
            provider,
            verified_identity,
            slot: Mutex::new(ReplySlot {
                reply: None,
                replied: false,
            }),
        }
    }

    /// The inbound message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Concatenation of the inbound message's text parts.
    pub fn text(&self) -> String {
        self.message.text()
    }

    /// Ambient storage handle.
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// The LLM provider the agent was built with, if any.
    pub fn provider(&self) -> Option<Arc<dyn Provider>> {
        self.provider.clone()
    }

    /// Verified sender identity.  Set only when the authenticated protocol
    /// verified this message; plaintext requests see `None`.
    pub fn verified_identity(&self) -> Option<&str> {
        self.verified_identity.as_deref()
    }

    /// Record a text reply.  The reply inherits the request's context id.
    /// Calling this (or [`MessageContext::reply_message`]) twice is a
    /// programmer error.
    pub fn reply(&self, content: impl Into<String>) -> Result<()> {
        let mut reply = Message::agent_text(content);
        if let Some(context_id) = &self.message.context_id {
            reply = reply.with_context_id(context_id.clone());
        }
        self.reply_message(reply)
    }

    /// Record a fully formed reply message.
    pub fn reply_message(&self, reply: Message) -> Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.replied {
            return Err(AgentError::internal(
                "handler replied twice; a handler may reply at most once",
            ));
        }
        slot.replied = true;
        slot.reply = Some(reply);
        Ok(())
    }

    /// Take the recorded reply, if any.  Called by the runtime after the
    /// handler returns; a handler that never replied yields `None` and the
    /// runtime synthesizes an empty agent message.
    pub fn take_reply(&self) -> Option<Message> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.reply.take()
    }

    /// Synthesize the reply used when a handler completes without replying.
    pub fn empty_reply(&self) -> Message {
        let mut reply = Message::new(Role::Agent, vec![crate::agentkit::message::Part::text("")]);
        if let Some(context_id) = &self.message.context_id {
            reply = reply.with_context_id(context_id.clone());
        }
        reply
    }
}
