//! Dispatch-level tests for cache and rate-limiter middleware wiring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentkit::builder::AgentBuilder;
use agentkit::cache::{CacheConfig, EvictionPolicy};
use agentkit::context::handler_fn;
use agentkit::message::Message;
use agentkit::middleware::ContentPredicate;
use agentkit::ratelimit::{key_global, TokenBucketConfig, TokenBucketLimiter};

#[tokio::test]
async fn test_cache_hit_returns_first_computed_reply() {
    let counter = Arc::new(AtomicU64::new(0));
    let counter_handler = Arc::clone(&counter);
    let runtime = AgentBuilder::new("cached-agent")
        .with_cache(CacheConfig {
            max_entries: 100,
            ttl: Duration::from_secs(300),
            policy: EvictionPolicy::Lru,
            user_messages_only: true,
        })
        .with_handler(handler_fn(move |ctx| {
            let counter = Arc::clone(&counter_handler);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.reply(format!("answer #{n}"))
            }
        }))
        .build()
        .unwrap();

    // Identical text and context, distinct message ids: same fingerprint.
    let first = runtime
        .dispatch(Message::user_text("what is the answer?").with_id("m1"))
        .await
        .unwrap();
    let second = runtime
        .dispatch(Message::user_text("what is the answer?").with_id("m2"))
        .await
        .unwrap();

    assert_eq!(first.text(), "answer #1");
    assert_eq!(second.text(), "answer #1");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let stats = runtime.cache().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_rate_limited_request_never_reaches_handler_or_cache() {
    let invocations = Arc::new(AtomicU64::new(0));
    let invocations_handler = Arc::clone(&invocations);
    let limiter = Arc::new(TokenBucketLimiter::new(TokenBucketConfig::new(0.001, 1)));
    let runtime = AgentBuilder::new("limited-agent")
        .with_cache(CacheConfig::default())
        .with_rate_limiter(limiter)
        .with_rate_limit_key(key_global())
        .with_handler(handler_fn(move |ctx| {
            let invocations = Arc::clone(&invocations_handler);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                ctx.reply("served")
            }
        }))
        .build()
        .unwrap();

    // First request drains the single token; second is denied.
    runtime
        .dispatch(Message::user_text("one").with_id("m1"))
        .await
        .unwrap();
    let err = runtime
        .dispatch(Message::user_text("two").with_id("m2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "rate_limit_exceeded");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // The denied request must not have touched cache state.
    let stats = runtime.cache().unwrap().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.sets, 1);
}

#[tokio::test]
async fn test_rejection_callback_synthesizes_reply() {
    let limiter = Arc::new(TokenBucketLimiter::new(TokenBucketConfig::new(0.001, 1)));
    let runtime = AgentBuilder::new("polite-agent")
        .with_rate_limiter(limiter)
        .with_rate_limit_key(key_global())
        .with_rate_limit_rejection(Arc::new(|_request: &Message| {
            Message::agent_text("try again later")
        }))
        .build()
        .unwrap();

    runtime
        .dispatch(Message::user_text("one").with_id("m1"))
        .await
        .unwrap();
    let reply = runtime
        .dispatch(Message::user_text("two").with_id("m2"))
        .await
        .unwrap();
    assert_eq!(reply.text(), "try again later");
}

#[tokio::test]
async fn test_content_filter_rejects_before_handler() {
    let invocations = Arc::new(AtomicU64::new(0));
    let invocations_handler = Arc::clone(&invocations);
    let predicate: ContentPredicate = Arc::new(|text: &str| !text.contains("ssn:"));
    let runtime = AgentBuilder::new("filtered-agent")
        .with_content_filter(predicate)
        .with_handler(handler_fn(move |ctx| {
            let invocations = Arc::clone(&invocations_handler);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                ctx.reply("ok")
            }
        }))
        .build()
        .unwrap();

    let err = runtime
        .dispatch(Message::user_text("my ssn: 123-45-6789"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    runtime
        .dispatch(Message::user_text("nothing sensitive here"))
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_middleware_bounds_slow_handlers() {
    let runtime = AgentBuilder::new("slow-agent")
        .with_timeout(Duration::from_millis(30))
        .with_handler(handler_fn(|ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ctx.reply("too late")
        }))
        .build()
        .unwrap();

    let err = runtime
        .dispatch(Message::user_text("quick please"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_reply_metadata_carries_duration_and_injected_entries() {
    let runtime = AgentBuilder::new("observed-agent")
        .with_metadata("agentName", serde_json::json!("observed-agent"))
        .build()
        .unwrap();
    let reply = runtime.dispatch(Message::user_text("hi")).await.unwrap();
    assert!(reply.metadata.contains_key("durationMs"));
    assert_eq!(reply.metadata["agentName"], "observed-agent");
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let runtime = AgentBuilder::new("crashy-agent")
        .with_handler(handler_fn(|_ctx| async move {
            panic!("handler exploded");
        }))
        .build()
        .unwrap();
    let err = runtime.dispatch(Message::user_text("hi")).await.unwrap_err();
    assert_eq!(err.kind(), "internal");

    // The runtime survives and keeps serving.
    let err = runtime
        .dispatch(Message::user_text("again"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "internal");
}
