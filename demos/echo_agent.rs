//! Minimal agent: start an echo service and call it once.
//!
//! Run with `cargo run --example echo_agent`.

use std::time::Duration;

use agentkit::builder::AgentBuilder;
use agentkit::client::AgentClient;
use agentkit::message::Message;

#[tokio::main]
async fn main() -> agentkit::error::Result<()> {
    agentkit::init_logger();

    let runtime = AgentBuilder::new("echo")
        .with_description("Replies with whatever you send it")
        .build()?;
    runtime.start("127.0.0.1:0").await?;
    let addr = runtime.local_addr().expect("listener is bound after start");
    println!("echo agent listening on {addr}");

    let client = AgentClient::new(format!("http://{addr}"));
    let reply = client.send_message(Message::user_text("hello, echo")).await?;
    println!("reply: {}", reply.text());

    runtime.stop(Duration::from_secs(5)).await?;
    Ok(())
}
