//! The agent runtime: dispatch pipeline and process lifecycle.
//!
//! An [`AgentRuntime`] is created by [`AgentBuilder`](crate::agentkit::builder::AgentBuilder)
//! and is immutable afterwards — the middleware chain, provider, storage,
//! and protocol settings are all fixed at build time, so serving requests
//! needs no runtime locking beyond what the shared components do
//! themselves.
//!
//! Dispatch order for each inbound message: resolve the effective protocol
//! (consulting the metadata marker in `auto` mode), verify authenticated
//! messages before anything else runs, then hand the message to the
//! middleware chain whose leaf invokes the user handler.  A verification
//! failure short-circuits with an unauthorized error: the handler is never
//! invoked and neither cache nor rate limiter observe the request.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentkit::builder::AgentBuilder;
//! use agentkit::context::handler_fn;
//! use std::time::Duration;
//!
//! # async fn demo() -> agentkit::error::Result<()> {
//! let runtime = AgentBuilder::new("greeter")
//!     .with_handler(handler_fn(|ctx| async move {
//!         ctx.reply(format!("hello, {}", ctx.text()))
//!     }))
//!     .build()?;
//! runtime.start("127.0.0.1:8080").await?;
//! // ... serve until shutdown ...
//! runtime.stop(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::agentkit::cache::ResponseCache;
use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Message;
use crate::agentkit::middleware::{Handler, RequestInfo};
use crate::agentkit::protocol::{
    detect_mode, verify_message, A2aConfig, ProtocolMode, SageConfig, Verifier,
};
use crate::agentkit::provider::{Provider, ProviderRegistry};
use crate::agentkit::ratelimit::RateLimiter;
use crate::agentkit::server::build_router;
use crate::agentkit::storage::Storage;

/// An async lifecycle hook run around start/stop.
pub type LifecycleHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Box an async closure into a [`LifecycleHook`].
pub fn lifecycle_hook<F, Fut>(f: F) -> LifecycleHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    shutdown: Option<watch::Sender<bool>>,
    serve_handle: Option<tokio::task::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Everything the builder assembles for a runtime.  Internal to the crate;
/// the builder is the only constructor.
pub(crate) struct RuntimeParts {
    pub name: String,
    pub description: String,
    pub version: String,
    pub protocol: ProtocolMode,
    pub a2a_config: A2aConfig,
    pub sage_config: Option<SageConfig>,
    pub verifier: Option<Arc<dyn Verifier>>,
    pub provider: Option<Arc<dyn Provider>>,
    pub registry: Option<Arc<ProviderRegistry>>,
    pub storage: Arc<dyn Storage>,
    pub chain: Handler,
    pub cache: Option<Arc<ResponseCache>>,
    pub limiter: Option<Arc<dyn RateLimiter>>,
    pub before_start: Option<LifecycleHook>,
    pub after_stop: Option<LifecycleHook>,
}

/// The dispatch core, shared between the runtime handle and the HTTP
/// server's request handlers.
pub(crate) struct Dispatcher {
    name: String,
    description: String,
    version: String,
    protocol: ProtocolMode,
    a2a_config: A2aConfig,
    sage_config: Option<SageConfig>,
    verifier: Option<Arc<dyn Verifier>>,
    provider: Option<Arc<dyn Provider>>,
    registry: Option<Arc<ProviderRegistry>>,
    storage: Arc<dyn Storage>,
    chain: Handler,
    cache: Option<Arc<ResponseCache>>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl Dispatcher {
    pub(crate) async fn dispatch_with_hint(
        &self,
        message: Message,
        hint: Option<ProtocolMode>,
    ) -> Result<Message> {
        let configured = match (self.protocol, hint) {
            (ProtocolMode::Auto, Some(hinted)) => hinted,
            (fixed, _) => fixed,
        };
        let effective = detect_mode(configured, &message);

        let mut info = RequestInfo {
            protocol: effective,
            verified_identity: None,
        };
        if effective == ProtocolMode::Sage {
            let verifier = self.verifier.as_ref().ok_or_else(|| {
                AgentError::unauthorized("authenticated message but no verifier configured")
            })?;
            let identity = verify_message(&message, verifier.as_ref()).await?;
            info.verified_identity = Some(identity);
        }

        (self.chain)(info, message).await
    }
}

/// A long-running agent: accepts messages, runs the middleware chain and
/// handler, and replies.
pub struct AgentRuntime {
    dispatcher: Arc<Dispatcher>,
    before_start: Option<LifecycleHook>,
    after_stop: Option<LifecycleHook>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("name", &self.dispatcher.name)
            .field("has_before_start", &self.before_start.is_some())
            .field("has_after_stop", &self.after_stop.is_some())
            .finish()
    }
}

impl AgentRuntime {
    pub(crate) fn from_parts(parts: RuntimeParts) -> Self {
        AgentRuntime {
            dispatcher: Arc::new(Dispatcher {
                name: parts.name,
                description: parts.description,
                version: parts.version,
                protocol: parts.protocol,
                a2a_config: parts.a2a_config,
                sage_config: parts.sage_config,
                verifier: parts.verifier,
                provider: parts.provider,
                registry: parts.registry,
                storage: parts.storage,
                chain: parts.chain,
                cache: parts.cache,
                limiter: parts.limiter,
            }),
            before_start: parts.before_start,
            after_stop: parts.after_stop,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.dispatcher.name
    }

    /// Agent description.
    pub fn description(&self) -> &str {
        &self.dispatcher.description
    }

    /// Agent version string.
    pub fn version(&self) -> &str {
        &self.dispatcher.version
    }

    /// Configured protocol mode.
    pub fn protocol(&self) -> ProtocolMode {
        self.dispatcher.protocol
    }

    /// Plaintext protocol settings.
    pub fn a2a_config(&self) -> &A2aConfig {
        &self.dispatcher.a2a_config
    }

    /// Authenticated protocol settings, when configured.
    pub fn sage_config(&self) -> Option<&SageConfig> {
        self.dispatcher.sage_config.as_ref()
    }

    /// Ambient storage handle.
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.dispatcher.storage)
    }

    /// The configured LLM provider, if any.
    pub fn provider(&self) -> Option<Arc<dyn Provider>> {
        self.dispatcher.provider.clone()
    }

    /// The provider registry, if one was configured.
    pub fn provider_registry(&self) -> Option<Arc<ProviderRegistry>> {
        self.dispatcher.registry.clone()
    }

    /// The response cache, if one was configured.
    pub fn cache(&self) -> Option<Arc<ResponseCache>> {
        self.dispatcher.cache.clone()
    }

    /// Address the listener bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local_addr
    }

    /// Process one inbound message through verification, the middleware
    /// chain, and the handler, yielding exactly one reply or an error.
    pub async fn dispatch(&self, message: Message) -> Result<Message> {
        self.dispatcher.dispatch_with_hint(message, None).await
    }

    /// [`AgentRuntime::dispatch`] with an outbound protocol hint (the
    /// `X-Protocol-Mode` header).  The hint only matters in `auto` mode;
    /// a fixed configured mode always wins.
    pub async fn dispatch_with_hint(
        &self,
        message: Message,
        hint: Option<ProtocolMode>,
    ) -> Result<Message> {
        self.dispatcher.dispatch_with_hint(message, hint).await
    }

    /// Begin accepting inbound requests on `addr`.
    ///
    /// Runs the before-start hook, binds the listener, and returns once the
    /// socket is bound; serving continues on a background task.  A second
    /// call after a completed first is a no-op.
    pub async fn start(&self, addr: &str) -> Result<()> {
        {
            let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if lifecycle.started {
                return Ok(());
            }
        }

        if let Some(hook) = &self.before_start {
            hook().await.map_err(|e| e.wrap("before-start hook"))?;
        }

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AgentError::unavailable(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AgentError::internal(format!("local addr: {e}")))?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = build_router(Arc::clone(&self.dispatcher));
        let name = self.dispatcher.name.clone();
        let serve_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("agent {name}: server error: {err}");
            }
        });

        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lifecycle.started = true;
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.serve_handle = Some(serve_handle);
        lifecycle.local_addr = Some(local_addr);
        info!("agent {} listening on {local_addr}", self.dispatcher.name);
        Ok(())
    }

    /// Stop accepting new requests and wait up to `deadline` for in-flight
    /// requests to drain, then run the after-stop hook.
    ///
    /// A blown deadline aborts the remaining work and is reported as a
    /// logged warning, not an error — shutdown is always total.  Idempotent.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let (shutdown, serve_handle) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if !lifecycle.started || lifecycle.stopped {
                return Ok(());
            }
            lifecycle.stopped = true;
            (lifecycle.shutdown.take(), lifecycle.serve_handle.take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = serve_handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(_) => info!("agent {} drained and stopped", self.dispatcher.name),
                Err(_) => {
                    warn!(
                        "agent {}: shutdown deadline {deadline:?} exceeded, aborting in-flight requests",
                        self.dispatcher.name
                    );
                }
            }
        }

        if let Some(limiter) = &self.dispatcher.limiter {
            limiter.close();
        }
        if let Some(hook) = &self.after_stop {
            if let Err(err) = hook().await {
                error!("agent {}: after-stop hook failed: {err}", self.dispatcher.name);
            }
        }
        Ok(())
    }
}

/// Build the chain leaf: construct the per-request context, run the user
/// handler, and turn its recorded reply (or silence) into the chain result.
pub(crate) fn leaf_handler(
    storage: Arc<dyn Storage>,
    provider: Option<Arc<dyn Provider>>,
    handler: crate::agentkit::context::AgentHandler,
) -> Handler {
    Arc::new(move |info: RequestInfo, message: Message| {
        let storage = Arc::clone(&storage);
        let provider = provider.clone();
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let ctx = Arc::new(crate::agentkit::context::MessageContext::new(
                message,
                storage,
                provider,
                info.verified_identity,
            ));
            handler(Arc::clone(&ctx)).await?;
            Ok(ctx.take_reply().unwrap_or_else(|| ctx.empty_reply()))
        })
    })
}
