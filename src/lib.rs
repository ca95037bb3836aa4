// src/lib.rs

// Import the top-level `agentkit` module.
pub mod agentkit;

// Re-export the modules at the crate root so callers write
// `agentkit::message::Message` instead of navigating the inner hierarchy.
pub use agentkit::{
    builder, cache, client, context, error, message, middleware, protocol, provider, providers,
    ratelimit, retry, sse, storage, tokens,
};

// Re-export the types most applications touch.
pub use agentkit::agent::{self, AgentRuntime};
pub use agentkit::builder::AgentBuilder;
pub use agentkit::client::AgentClient;
pub use agentkit::context::{handler_fn, MessageContext};
pub use agentkit::error::{AgentError, Result};
pub use agentkit::message::{Message, Part, Role};
pub use agentkit::provider::{Provider, ProviderRegistry};

use std::sync::Once;

static LOGGER_INIT: Once = Once::new();

/// Initialize `env_logger` once for the whole process.  Safe to call from
/// every test or binary entry point; later calls are no-ops.
pub fn init_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::Builder::from_default_env().try_init();
    });
}
