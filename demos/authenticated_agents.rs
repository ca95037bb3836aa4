//! Two agents talking over the authenticated protocol.
//!
//! Both sides share a signing secret; the receiver verifies every inbound
//! message and exposes the caller's DID to the handler.  Run with
//! `cargo run --example authenticated_agents`.

use std::time::Duration;

use agentkit::builder::AgentBuilder;
use agentkit::client::AgentClient;
use agentkit::context::handler_fn;
use agentkit::message::Message;
use agentkit::protocol::{ProtocolMode, SageConfig, SigningKey};

const SHARED_SECRET: &[u8] = b"rotate me in production";

#[tokio::main]
async fn main() -> agentkit::error::Result<()> {
    agentkit::init_logger();

    let receiver = AgentBuilder::new("vault")
        .with_protocol(ProtocolMode::Sage)
        .with_sage_config(SageConfig::new("did:sage:vault"))
        .with_signing_key(SigningKey::from_secret(SHARED_SECRET.to_vec()))
        .with_handler(handler_fn(|ctx| async move {
            let caller = ctx.verified_identity().unwrap_or("unknown").to_string();
            ctx.reply(format!("access granted to {caller}"))
        }))
        .build()?;
    receiver.start("127.0.0.1:0").await?;
    let addr = receiver.local_addr().expect("listener is bound after start");
    println!("vault listening on {addr}");

    let client = AgentClient::new(format!("http://{addr}"))
        .with_protocol(ProtocolMode::Sage)
        .with_identity(
            SageConfig::new("did:sage:courier"),
            SigningKey::from_secret(SHARED_SECRET.to_vec()),
        );
    let reply = client.send_message(Message::user_text("open sesame")).await?;
    println!("vault said: {}", reply.text());

    receiver.stop(Duration::from_secs(5)).await?;
    Ok(())
}
