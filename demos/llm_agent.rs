//! An agent whose handler consults an LLM provider.
//!
//! Requires `OPENAI_API_KEY` (and optionally `OPENAI_MODEL`) in the
//! environment.  Run with `cargo run --example llm_agent`.

use std::sync::Arc;
use std::time::Duration;

use agentkit::builder::AgentBuilder;
use agentkit::client::AgentClient;
use agentkit::context::handler_fn;
use agentkit::error::AgentError;
use agentkit::message::{Message, Role};
use agentkit::provider::{ChatMessage, CompletionRequest};
use agentkit::providers::openai::OpenAIProvider;

#[tokio::main]
async fn main() -> agentkit::error::Result<()> {
    agentkit::init_logger();

    let provider = Arc::new(OpenAIProvider::from_env()?);
    let runtime = AgentBuilder::new("assistant")
        .with_description("Answers questions with an LLM")
        .with_provider(provider)
        .with_timeout(Duration::from_secs(60))
        .with_handler(handler_fn(|ctx| async move {
            let provider = ctx
                .provider()
                .ok_or_else(|| AgentError::internal("no provider configured"))?;
            let request = CompletionRequest::new(vec![
                ChatMessage::new(Role::System, "Answer in one short paragraph."),
                ChatMessage::new(Role::User, ctx.text()),
            ])
            .with_max_tokens(256);
            let response = provider.complete(request).await?;
            ctx.reply(response.content)
        }))
        .build()?;

    runtime.start("127.0.0.1:0").await?;
    let addr = runtime.local_addr().expect("listener is bound after start");
    println!("assistant listening on {addr}");

    let client = AgentClient::new(format!("http://{addr}"));
    let reply = client
        .send_message(Message::user_text("Why is the sky blue?"))
        .await?;
    println!("assistant: {}", reply.text());

    runtime.stop(Duration::from_secs(5)).await?;
    Ok(())
}
