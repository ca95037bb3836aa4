//! Client SDK tests: retry with backoff against a flaky peer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentkit::builder::AgentBuilder;
use agentkit::client::AgentClient;
use agentkit::context::handler_fn;
use agentkit::error::AgentError;
use agentkit::message::Message;
use agentkit::retry::RetryConfig;
use agentkit::AgentRuntime;

async fn start(runtime: AgentRuntime) -> (Arc<AgentRuntime>, String) {
    let runtime = Arc::new(runtime);
    runtime.start("127.0.0.1:0").await.unwrap();
    let addr = runtime.local_addr().unwrap();
    (runtime, format!("http://{addr}"))
}

/// Peer whose handler fails with `unavailable` (wire 503) for the first
/// `failures` invocations, then replies normally.
fn flaky_peer(failures: u32, invocations: Arc<AtomicU32>) -> AgentRuntime {
    AgentBuilder::new("flaky-peer")
        .with_handler(handler_fn(move |ctx| {
            let invocations = Arc::clone(&invocations);
            async move {
                let n = invocations.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(AgentError::unavailable("warming up"))
                } else {
                    ctx.reply("finally awake")
                }
            }
        }))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_retry_succeeds_after_two_503s() {
    agentkit::init_logger();
    let invocations = Arc::new(AtomicU32::new(0));
    let (peer, base) = start(flaky_peer(2, Arc::clone(&invocations))).await;

    let client = AgentClient::new(&base).with_retry(
        RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter_factor(0.0),
    );

    let started = Instant::now();
    let reply = client
        .send_message(Message::user_text("wake up"))
        .await
        .unwrap();
    assert_eq!(reply.text(), "finally awake");

    // Backoff: 10ms after the first failure, 20ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(30));
    // The peer handler observed exactly three invocations.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    peer.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_retry_budget_exhaustion_surfaces_last_error() {
    let invocations = Arc::new(AtomicU32::new(0));
    let (peer, base) = start(flaky_peer(10, Arc::clone(&invocations))).await;

    let client = AgentClient::new(&base).with_retry(
        RetryConfig::default()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(5)),
    );
    let err = client
        .send_message(Message::user_text("wake up"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unavailable");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    peer.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_invalid_input_is_not_retried() {
    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_handler = Arc::clone(&invocations);
    let peer = AgentBuilder::new("picky-peer")
        .with_handler(handler_fn(move |_ctx| {
            let invocations = Arc::clone(&invocations_handler);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::invalid_input("no thanks"))
            }
        }))
        .build()
        .unwrap();
    let (peer, base) = start(peer).await;

    let client = AgentClient::new(&base)
        .with_retry(RetryConfig::default().with_initial_delay(Duration::from_millis(5)));
    let err = client
        .send_message(Message::user_text("hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    peer.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_peer_is_unavailable() {
    // Nothing listens on this port.
    let client = AgentClient::new("http://127.0.0.1:1")
        .with_timeout(Duration::from_millis(500))
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_initial_delay(Duration::from_millis(5)),
        );
    let err = client
        .send_message(Message::user_text("hello?"))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), "unavailable" | "timeout"));
}
