//! Fluent construction of an [`AgentRuntime`].
//!
//! The builder is the single source of configuration: everything the
//! runtime will ever use — protocol mode, provider, storage, cache, rate
//! limiter, middleware, hooks — is declared here, validated in one pass by
//! [`AgentBuilder::build`], and frozen into the runtime.  Validation
//! collects every violation before failing so a misconfigured agent can be
//! fixed in one edit, and it never hands back a partially usable runtime.
//!
//! Defaults applied when a knob is left unset: plaintext protocol,
//! in-memory storage, and an echo handler that replies with the request
//! text.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentkit::builder::AgentBuilder;
//! use agentkit::cache::CacheConfig;
//! use agentkit::context::handler_fn;
//!
//! # fn demo() -> agentkit::error::Result<()> {
//! let runtime = AgentBuilder::new("summarizer")
//!     .with_description("Summarizes whatever you send it")
//!     .with_version("0.3.1")
//!     .with_cache(CacheConfig::default())
//!     .with_handler(handler_fn(|ctx| async move {
//!         ctx.reply(format!("summary: {}", ctx.text()))
//!     }))
//!     .build()?;
//! # let _ = runtime;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::agentkit::agent::{leaf_handler, AgentRuntime, LifecycleHook, RuntimeParts};
use crate::agentkit::cache::{cache_middleware, CacheConfig, ResponseCache};
use crate::agentkit::context::{handler_fn, AgentHandler};
use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::middleware::{
    compose, content_filter_middleware, logger_middleware, metadata_middleware,
    recovery_middleware, request_id_middleware, timeout_middleware, timer_middleware,
    validator_middleware, ContentPredicate, Middleware,
};
use crate::agentkit::protocol::{
    A2aConfig, ProtocolMode, SageConfig, SharedKeyVerifier, SigningKey, Verifier,
};
use crate::agentkit::provider::{Provider, ProviderRegistry};
use crate::agentkit::ratelimit::{key_by_message_id, rate_limit_middleware, KeyFn, OnRejected, RateLimiter};
use crate::agentkit::storage::{MemoryStorage, Storage};

/// Builder for [`AgentRuntime`].
pub struct AgentBuilder {
    name: String,
    description: String,
    version: String,
    protocol: ProtocolMode,
    a2a_config: A2aConfig,
    sage_config: Option<SageConfig>,
    signing_key: Option<SigningKey>,
    verifier: Option<Arc<dyn Verifier>>,
    provider: Option<Arc<dyn Provider>>,
    registry: Option<Arc<ProviderRegistry>>,
    storage: Option<Arc<dyn Storage>>,
    handler: Option<AgentHandler>,
    cache_config: Option<CacheConfig>,
    limiter: Option<Arc<dyn RateLimiter>>,
    limiter_key_fn: Option<KeyFn>,
    limiter_on_rejected: Option<OnRejected>,
    timeout: Option<Duration>,
    metadata: Map<String, Value>,
    content_filter: Option<ContentPredicate>,
    middleware: Vec<Middleware>,
    before_start: Option<LifecycleHook>,
    after_stop: Option<LifecycleHook>,
}

impl AgentBuilder {
    /// Start building an agent with the given (required, non-empty) name.
    pub fn new(name: impl Into<String>) -> Self {
        AgentBuilder {
            name: name.into(),
            description: String::new(),
            version: "0.1.0".to_string(),
            protocol: ProtocolMode::default(),
            a2a_config: A2aConfig::default(),
            sage_config: None,
            signing_key: None,
            verifier: None,
            provider: None,
            registry: None,
            storage: None,
            handler: None,
            cache_config: None,
            limiter: None,
            limiter_key_fn: None,
            limiter_on_rejected: None,
            timeout: None,
            metadata: Map::new(),
            content_filter: None,
            middleware: Vec::new(),
            before_start: None,
            after_stop: None,
        }
    }

    /// Human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Version string advertised by the agent.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Protocol mode (defaults to plaintext).
    pub fn with_protocol(mut self, protocol: ProtocolMode) -> Self {
        self.protocol = protocol;
        self
    }

    /// Plaintext protocol settings.
    pub fn with_a2a_config(mut self, config: A2aConfig) -> Self {
        self.a2a_config = config;
        self
    }

    /// Authenticated protocol settings.
    pub fn with_sage_config(mut self, config: SageConfig) -> Self {
        self.sage_config = Some(config);
        self
    }

    /// Signing key for the authenticated protocol.  Also serves as the
    /// default shared-key verifier when no explicit verifier is injected.
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Inbound verification capability.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// LLM provider handle exposed to the handler.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Provider registry for handlers that pick among several back ends.
    /// Passed explicitly rather than living in a process-wide global so
    /// tests stay isolated.
    pub fn with_provider_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Storage backend (defaults to in-memory).
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// The message handler (defaults to echo).
    pub fn with_handler(mut self, handler: AgentHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Enable the response cache.
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache_config = Some(config);
        self
    }

    /// Enable rate limiting with the default per-message-id key.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Key function for the rate limiter.
    pub fn with_rate_limit_key(mut self, key_fn: KeyFn) -> Self {
        self.limiter_key_fn = Some(key_fn);
        self
    }

    /// Synthesize a reply for rate-limited requests instead of erroring.
    pub fn with_rate_limit_rejection(mut self, on_rejected: OnRejected) -> Self {
        self.limiter_on_rejected = Some(on_rejected);
        self
    }

    /// Per-request deadline enforced by the timeout middleware.
    pub fn with_timeout(mut self, deadline: Duration) -> Self {
        self.timeout = Some(deadline);
        self
    }

    /// Fixed metadata injected into every reply.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Reject requests whose text fails the predicate.
    pub fn with_content_filter(mut self, predicate: ContentPredicate) -> Self {
        self.content_filter = Some(predicate);
        self
    }

    /// Append a custom middleware.  Custom layers run after the built-ins
    /// and before rate limiting, caching, and the handler.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Hook run before the listener binds.
    pub fn with_before_start(mut self, hook: LifecycleHook) -> Self {
        self.before_start = Some(hook);
        self
    }

    /// Hook run after shutdown completes.
    pub fn with_after_stop(mut self, hook: LifecycleHook) -> Self {
        self.after_stop = Some(hook);
        self
    }

    /// Validate the whole configuration and assemble the runtime.
    ///
    /// Fails with [`AgentError::Validation`] listing every violation; on
    /// failure no runtime exists at all.  Building twice from the same
    /// builder yields runtimes with identical observable configuration.
    pub fn build(&self) -> Result<AgentRuntime> {
        let mut violations = Vec::new();
        if self.name.trim().is_empty() {
            violations.push("name must not be empty".to_string());
        }
        if self.protocol == ProtocolMode::Sage {
            if self.sage_config.is_none() {
                violations.push("sage protocol requires a protocol config".to_string());
            }
            if self.signing_key.is_none() {
                violations.push("sage protocol requires a signing key".to_string());
            }
        }
        if let Some(cache) = &self.cache_config {
            if cache.max_entries == 0 {
                violations.push("cache max_entries must be positive".to_string());
            }
        }
        if !violations.is_empty() {
            return Err(AgentError::Validation(violations));
        }

        let storage = self
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()) as Arc<dyn Storage>);
        let handler = self.handler.clone().unwrap_or_else(echo_handler);
        let verifier = self.verifier.clone().or_else(|| {
            self.signing_key
                .clone()
                .map(|key| Arc::new(SharedKeyVerifier::new(key)) as Arc<dyn Verifier>)
        });
        let cache = self
            .cache_config
            .clone()
            .map(|config| Arc::new(ResponseCache::new(config)));

        // Assembly order is load-bearing; see the middleware module docs.
        let mut chain: Vec<Middleware> = vec![
            recovery_middleware(),
            request_id_middleware(),
            logger_middleware(),
            timer_middleware(),
            validator_middleware(),
        ];
        if let Some(deadline) = self.timeout {
            chain.push(timeout_middleware(deadline));
        }
        if !self.metadata.is_empty() {
            chain.push(metadata_middleware(self.metadata.clone()));
        }
        if let Some(predicate) = &self.content_filter {
            chain.push(content_filter_middleware(Arc::clone(predicate)));
        }
        chain.extend(self.middleware.iter().cloned());
        if let Some(limiter) = &self.limiter {
            chain.push(rate_limit_middleware(
                Arc::clone(limiter),
                self.limiter_key_fn
                    .clone()
                    .unwrap_or_else(key_by_message_id),
                self.limiter_on_rejected.clone(),
            ));
        }
        if let Some(cache) = &cache {
            chain.push(cache_middleware(Arc::clone(cache)));
        }

        let leaf = leaf_handler(Arc::clone(&storage), self.provider.clone(), handler);
        let chain = compose(&chain, leaf);

        Ok(AgentRuntime::from_parts(RuntimeParts {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            protocol: self.protocol,
            a2a_config: self.a2a_config.clone(),
            sage_config: self.sage_config.clone(),
            verifier,
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            storage,
            chain,
            cache,
            limiter: self.limiter.clone(),
            before_start: self.before_start.clone(),
            after_stop: self.after_stop.clone(),
        }))
    }
}

/// The default handler: replies with the request's concatenated text.
fn echo_handler() -> AgentHandler {
    handler_fn(|ctx| async move { ctx.reply(ctx.text()) })
}
