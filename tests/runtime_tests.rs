//! End-to-end tests for the agent runtime over HTTP.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentkit::builder::AgentBuilder;
use agentkit::cache::CacheConfig;
use agentkit::client::{AgentClient, StreamChunk};
use agentkit::context::handler_fn;
use agentkit::message::{Message, Role};
use agentkit::protocol::{ProtocolMode, SageConfig, SigningKey};
use agentkit::ratelimit::{key_global, RateLimiter, TokenBucketConfig, TokenBucketLimiter};
use agentkit::AgentRuntime;

async fn start(runtime: AgentRuntime) -> (Arc<AgentRuntime>, String) {
    let runtime = Arc::new(runtime);
    runtime.start("127.0.0.1:0").await.unwrap();
    let addr = runtime.local_addr().unwrap();
    (runtime, format!("http://{addr}"))
}

#[tokio::test]
async fn test_echo_under_a2a() {
    agentkit::init_logger();
    let runtime = AgentBuilder::new("echo-agent").build().unwrap();
    let (runtime, base) = start(runtime).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&serde_json::json!({
            "messageId": "m1",
            "role": "user",
            "parts": [{"kind": "text", "text": "hi"}],
            "kind": "message",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let reply: Message = response.json().await.unwrap();
    assert_eq!(reply.role, Role::Agent);
    assert_eq!(reply.text(), "hi");

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_malformed_body_maps_to_invalid_input() {
    let runtime = AgentBuilder::new("strict").build().unwrap();
    let (runtime, base) = start(runtime).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_input");

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_protocol_hint_rejected() {
    let runtime = AgentBuilder::new("hinted").build().unwrap();
    let (runtime, base) = start(runtime).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("X-Protocol-Mode", "carrier-pigeon")
        .json(&Message::user_text("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_streaming_endpoint_delivers_message_then_done() {
    let runtime = AgentBuilder::new("streamer").build().unwrap();
    let (runtime, base) = start(runtime).await;

    let client = AgentClient::new(&base);
    let mut chunks = client
        .stream_message(Message::user_text("stream me"))
        .await
        .unwrap();

    match chunks.recv().await {
        Some(StreamChunk::Message(reply)) => assert_eq!(reply.text(), "stream me"),
        other => panic!("expected message chunk, got {other:?}"),
    }
    // The done sentinel closes the channel with no further chunks.
    assert!(chunks.recv().await.is_none());

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_sage_verification_failure_short_circuits() {
    agentkit::init_logger();
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_handler = Arc::clone(&invoked);

    let limiter = Arc::new(TokenBucketLimiter::new(TokenBucketConfig::new(100.0, 100)));
    let runtime = AgentBuilder::new("secure-agent")
        .with_protocol(ProtocolMode::Sage)
        .with_sage_config(SageConfig::new("did:sage:secure-agent"))
        .with_signing_key(SigningKey::from_secret(b"server secret".to_vec()))
        .with_cache(CacheConfig::default())
        .with_rate_limiter(limiter.clone())
        .with_rate_limit_key(key_global())
        .with_handler(handler_fn(move |ctx| {
            let invoked = Arc::clone(&invoked_handler);
            async move {
                invoked.store(true, Ordering::SeqCst);
                ctx.reply("should never happen")
            }
        }))
        .build()
        .unwrap();
    let (runtime, base) = start(runtime).await;

    // Signed with the wrong key: verification must fail.
    let client = AgentClient::new(&base)
        .with_protocol(ProtocolMode::Sage)
        .with_identity(
            SageConfig::new("did:sage:imposter"),
            SigningKey::from_secret(b"wrong secret".to_vec()),
        );
    let err = client
        .send_message(Message::user_text("let me in"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unauthorized");

    // The handler never ran, and neither cache nor limiter saw the request.
    assert!(!invoked.load(Ordering::SeqCst));
    let cache_stats = runtime.cache().unwrap().stats();
    assert_eq!(cache_stats.hits + cache_stats.misses + cache_stats.sets, 0);
    let limiter_stats = limiter.stats();
    assert_eq!(limiter_stats.allowed + limiter_stats.denied, 0);

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_sage_round_trip_exposes_verified_identity() {
    let runtime = AgentBuilder::new("secure-agent")
        .with_protocol(ProtocolMode::Sage)
        .with_sage_config(SageConfig::new("did:sage:secure-agent"))
        .with_signing_key(SigningKey::from_secret(b"shared secret".to_vec()))
        .with_handler(handler_fn(|ctx| async move {
            let who = ctx.verified_identity().unwrap_or("nobody").to_string();
            ctx.reply(format!("verified: {who}"))
        }))
        .build()
        .unwrap();
    let (runtime, base) = start(runtime).await;

    let client = AgentClient::new(&base)
        .with_protocol(ProtocolMode::Sage)
        .with_identity(
            SageConfig::new("did:sage:caller"),
            SigningKey::from_secret(b"shared secret".to_vec()),
        );
    let reply = client
        .send_message(Message::user_text("hello"))
        .await
        .unwrap();
    assert_eq!(reply.text(), "verified: did:sage:caller");

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_auto_mode_routes_by_metadata_marker() {
    let runtime = AgentBuilder::new("auto-agent")
        .with_protocol(ProtocolMode::Auto)
        .with_signing_key(SigningKey::from_secret(b"shared secret".to_vec()))
        .with_handler(handler_fn(|ctx| async move {
            let mode = match ctx.verified_identity() {
                Some(_) => "authenticated",
                None => "plaintext",
            };
            ctx.reply(mode)
        }))
        .build()
        .unwrap();
    let (runtime, base) = start(runtime).await;

    // An unsigned message falls through to plaintext.
    let plain = AgentClient::new(&base);
    let reply = plain.send_message(Message::user_text("hi")).await.unwrap();
    assert_eq!(reply.text(), "plaintext");

    // A signed message routes to verification.
    let signed = AgentClient::new(&base)
        .with_protocol(ProtocolMode::Sage)
        .with_identity(
            SageConfig::new("did:sage:caller"),
            SigningKey::from_secret(b"shared secret".to_vec()),
        );
    let reply = signed.send_message(Message::user_text("hi")).await.unwrap();
    assert_eq!(reply.text(), "authenticated");

    runtime.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_handler_without_reply_synthesizes_empty_agent_message() {
    let runtime = AgentBuilder::new("silent")
        .with_handler(handler_fn(|_ctx| async move { Ok(()) }))
        .build()
        .unwrap();
    let reply = runtime
        .dispatch(Message::user_text("anyone there?"))
        .await
        .unwrap();
    assert_eq!(reply.role, Role::Agent);
    assert_eq!(reply.text(), "");
}

#[tokio::test]
async fn test_lifecycle_hooks_and_idempotent_stop() {
    let before = Arc::new(AtomicU64::new(0));
    let after = Arc::new(AtomicU64::new(0));
    let before_hook = Arc::clone(&before);
    let after_hook = Arc::clone(&after);

    let runtime = AgentBuilder::new("lifecycle")
        .with_before_start(agentkit::agent::lifecycle_hook(move || {
            let before = Arc::clone(&before_hook);
            async move {
                before.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .with_after_stop(agentkit::agent::lifecycle_hook(move || {
            let after = Arc::clone(&after_hook);
            async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .build()
        .unwrap();
    let runtime = Arc::new(runtime);

    runtime.start("127.0.0.1:0").await.unwrap();
    assert_eq!(before.load(Ordering::SeqCst), 1);
    // A second start is a no-op: the hook does not run again.
    runtime.start("127.0.0.1:0").await.unwrap();
    assert_eq!(before.load(Ordering::SeqCst), 1);

    runtime.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(after.load(Ordering::SeqCst), 1);
    runtime.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_double_reply_is_reported_as_internal() {
    let runtime = AgentBuilder::new("chatty")
        .with_handler(handler_fn(|ctx| async move {
            ctx.reply("first")?;
            ctx.reply("second")
        }))
        .build()
        .unwrap();
    let err = runtime
        .dispatch(Message::user_text("hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "internal");
}
