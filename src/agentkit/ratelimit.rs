//! Per-key admission control.
//!
//! Three limiter implementations share the [`RateLimiter`] capability set:
//! an in-process token bucket, an in-process sliding window, and a
//! storage-backed distributed limiter for fleets that must share one
//! budget.  Each keeps per-key state in a map guarded by a small outer
//! lock, with the state itself behind its own per-key lock so decisions
//! stay linearizable per key without serializing unrelated keys.
//!
//! Every in-process limiter runs a background cleanup task that discards
//! state idle longer than twice its window (or the refill-equivalent) and
//! enforces a max-keys cap by evicting the oldest keys first.  [`RateLimiter::close`]
//! cancels the task.
//!
//! Cancellation: `wait` is a plain future — wrap it in
//! `tokio::time::timeout` (or drop it) to abandon the wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::json;
use tokio::sync::watch;

use crate::agentkit::error::{AgentError, Result};
use crate::agentkit::message::Message;
use crate::agentkit::middleware::{Handler, Middleware};
use crate::agentkit::storage::Storage;

/// Floor for the retry pause inside [`RateLimiter::wait`].
const MIN_WAIT_STEP: Duration = Duration::from_millis(10);

/// Counters exposed by [`RateLimiter::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Requests admitted.
    pub allowed: u64,
    /// Requests denied.
    pub denied: u64,
    /// Keys with live state right now.
    pub current_keys: usize,
    /// Distinct keys ever tracked.
    pub total_keys: u64,
}

/// Per-key admission control capability set.
///
/// Implementations must be safe for concurrent use and linearizable per
/// key; across keys only per-key serializability is promised.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit a single request under `key`.
    async fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1).await
    }

    /// Admit `n` requests at once under `key`.  `n == 0` always admits.
    async fn allow_n(&self, key: &str, n: u32) -> bool;

    /// Block until a request under `key` is admitted.  Callers impose
    /// deadlines by wrapping the future in a timeout.
    async fn wait(&self, key: &str) -> Result<()> {
        loop {
            if self.allow_n(key, 1).await {
                return Ok(());
            }
            let delay = self.reserve(key).await.max(MIN_WAIT_STEP);
            tokio::time::sleep(delay).await;
        }
    }

    /// Predicted delay until one request under `key` would be admitted.
    /// Zero means it would be admitted right now.  Does not consume.
    async fn reserve(&self, key: &str) -> Duration;

    /// Drop all state for `key`.
    async fn reset(&self, key: &str);

    /// Snapshot of the counters.
    fn stats(&self) -> RateLimiterStats;

    /// Stop background maintenance.  Idempotent.
    fn close(&self);
}

#[derive(Default)]
struct SharedCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
    total_keys: AtomicU64,
}

/// Handle to a background cleanup task.
struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CleanupTask {
    fn spawn<F>(interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(),
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        CleanupTask {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Token bucket tuning.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Bucket capacity in tokens.
    pub capacity: u32,
    /// How often idle keys are swept.
    pub cleanup_interval: Duration,
    /// Hard cap on tracked keys; exceeding it evicts the oldest first.
    pub max_keys: usize,
}

impl TokenBucketConfig {
    /// Convenience constructor for the two interesting knobs.
    pub fn new(rate: f64, capacity: u32) -> Self {
        TokenBucketConfig {
            rate,
            capacity,
            cleanup_interval: Duration::from_secs(60),
            max_keys: 10_000,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

type KeyMap<S> = Arc<Mutex<HashMap<String, Arc<Mutex<S>>>>>;

/// Classic token-bucket limiter: tokens refill continuously at `rate` and
/// clamp at `capacity`; a request for `n` tokens is admitted when the
/// bucket holds at least `n`.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    keys: KeyMap<BucketState>,
    counters: Arc<SharedCounters>,
    cleanup: CleanupTask,
}

impl TokenBucketLimiter {
    /// Create a limiter and start its cleanup task.  Must be called from
    /// within a tokio runtime.
    pub fn new(config: TokenBucketConfig) -> Self {
        let keys: KeyMap<BucketState> = Arc::new(Mutex::new(HashMap::new()));
        // A bucket twice-refilled from empty has forgotten everything
        // useful, so that is the idle horizon.
        let idle_ttl = Duration::from_secs_f64(
            (f64::from(config.capacity.max(1)) / config.rate.max(f64::EPSILON)) * 2.0,
        )
        .max(config.cleanup_interval);
        let sweep_keys = Arc::clone(&keys);
        let max_keys = config.max_keys;
        let cleanup = CleanupTask::spawn(config.cleanup_interval, move || {
            sweep_idle(&sweep_keys, idle_ttl, max_keys, |s| s.last_seen);
        });
        TokenBucketLimiter {
            config,
            keys,
            counters: Arc::new(SharedCounters::default()),
            cleanup,
        }
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<BucketState>> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if keys.len() >= self.config.max_keys && !keys.contains_key(key) {
            evict_oldest(&mut keys, |s| s.last_seen);
        }
        Arc::clone(keys.entry(key.to_string()).or_insert_with(|| {
            self.counters.total_keys.fetch_add(1, Ordering::Relaxed);
            Arc::new(Mutex::new(BucketState {
                tokens: f64::from(self.config.capacity),
                last_refill: Instant::now(),
                last_seen: Instant::now(),
            }))
        }))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.config.rate).min(f64::from(self.config.capacity));
        state.last_refill = now;
        state.last_seen = now;
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow_n(&self, key: &str, n: u32) -> bool {
        if n == 0 {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let bucket = self.bucket(key);
        let mut state = bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, Instant::now());
        if state.tokens >= f64::from(n) {
            state.tokens -= f64::from(n);
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    async fn reserve(&self, key: &str) -> Duration {
        let bucket = self.bucket(key);
        let mut state = bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.config.rate.max(f64::EPSILON))
        }
    }

    async fn reset(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(key);
    }

    fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            current_keys: self.keys.lock().unwrap_or_else(|e| e.into_inner()).len(),
            total_keys: self.counters.total_keys.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.cleanup.stop();
    }
}

// ---------------------------------------------------------------------------
// Sliding window
// ---------------------------------------------------------------------------

/// Sliding window tuning.
#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    /// Maximum admitted requests inside any window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
    /// How often idle keys are swept.
    pub cleanup_interval: Duration,
    /// Hard cap on tracked keys; exceeding it evicts the oldest first.
    pub max_keys: usize,
}

impl SlidingWindowConfig {
    /// Convenience constructor for the two interesting knobs.
    pub fn new(limit: u32, window: Duration) -> Self {
        SlidingWindowConfig {
            limit,
            window,
            cleanup_interval: Duration::from_secs(60),
            max_keys: 10_000,
        }
    }
}

struct WindowState {
    instants: Vec<Instant>,
    last_seen: Instant,
}

/// Sliding-window limiter: at any instant the number of admissions inside
/// the trailing window never exceeds the limit.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    keys: KeyMap<WindowState>,
    counters: Arc<SharedCounters>,
    cleanup: CleanupTask,
}

impl SlidingWindowLimiter {
    /// Create a limiter and start its cleanup task.  Must be called from
    /// within a tokio runtime.
    pub fn new(config: SlidingWindowConfig) -> Self {
        let keys: KeyMap<WindowState> = Arc::new(Mutex::new(HashMap::new()));
        let idle_ttl = (config.window * 2).max(config.cleanup_interval);
        let sweep_keys = Arc::clone(&keys);
        let max_keys = config.max_keys;
        let cleanup = CleanupTask::spawn(config.cleanup_interval, move || {
            sweep_idle(&sweep_keys, idle_ttl, max_keys, |s| s.last_seen);
        });
        SlidingWindowLimiter {
            config,
            keys,
            counters: Arc::new(SharedCounters::default()),
            cleanup,
        }
    }

    fn window_state(&self, key: &str) -> Arc<Mutex<WindowState>> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if keys.len() >= self.config.max_keys && !keys.contains_key(key) {
            evict_oldest(&mut keys, |s| s.last_seen);
        }
        Arc::clone(keys.entry(key.to_string()).or_insert_with(|| {
            self.counters.total_keys.fetch_add(1, Ordering::Relaxed);
            Arc::new(Mutex::new(WindowState {
                instants: Vec::new(),
                last_seen: Instant::now(),
            }))
        }))
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow_n(&self, key: &str, n: u32) -> bool {
        if n == 0 {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let state = self.window_state(key);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.last_seen = now;
        let cutoff = now.checked_sub(self.config.window);
        state
            .instants
            .retain(|t| cutoff.map_or(true, |cut| *t > cut));

        if state.instants.len() + n as usize <= self.config.limit as usize {
            state.instants.extend(std::iter::repeat(now).take(n as usize));
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    async fn reserve(&self, key: &str) -> Duration {
        let state = self.window_state(key);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window);
        state
            .instants
            .retain(|t| cutoff.map_or(true, |cut| *t > cut));

        if (state.instants.len() as u32) < self.config.limit {
            Duration::ZERO
        } else {
            // Room opens when the oldest admission slides out of the window.
            state
                .instants
                .first()
                .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO)
        }
    }

    async fn reset(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(key);
    }

    fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            current_keys: self.keys.lock().unwrap_or_else(|e| e.into_inner()).len(),
            total_keys: self.counters.total_keys.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.cleanup.stop();
    }
}

// ---------------------------------------------------------------------------
// Distributed (storage-backed)
// ---------------------------------------------------------------------------

/// Algorithm used by the distributed limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedAlgorithm {
    /// Timestamp list per key; exact within the consistency of the store.
    SlidingWindow,
    /// Counter per `floor(now / window)` bucket; cheaper, coarser.
    FixedWindow,
}

/// Distributed limiter tuning.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Maximum admitted requests per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
    /// Counting algorithm.
    pub algorithm: DistributedAlgorithm,
    /// Storage namespace holding limiter state.
    pub namespace: String,
}

impl DistributedConfig {
    /// Convenience constructor with the `ratelimit` namespace.
    pub fn new(limit: u32, window: Duration, algorithm: DistributedAlgorithm) -> Self {
        DistributedConfig {
            limit,
            window,
            algorithm,
            namespace: "ratelimit".to_string(),
        }
    }
}

/// Limiter sharing its state through the [`Storage`] contract so several
/// processes can enforce one budget.  Offers the consistency of the
/// backing store; in-process callers are additionally serialized per key.
pub struct DistributedRateLimiter {
    config: DistributedConfig,
    storage: Arc<dyn Storage>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    counters: Arc<SharedCounters>,
}

impl DistributedRateLimiter {
    /// Create a limiter over the given store.
    pub fn new(config: DistributedConfig, storage: Arc<dyn Storage>) -> Self {
        DistributedRateLimiter {
            config,
            storage,
            locks: Mutex::new(HashMap::new()),
            counters: Arc::new(SharedCounters::default()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if !locks.contains_key(key) {
            self.counters.total_keys.fetch_add(1, Ordering::Relaxed);
        }
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    fn bucket_id(&self, now_millis: u64) -> u64 {
        now_millis / self.config.window.as_millis().max(1) as u64
    }

    async fn allow_sliding(&self, key: &str, n: u32) -> bool {
        let now = Self::now_millis();
        let window_millis = self.config.window.as_millis() as u64;
        let mut stamps: Vec<u64> = match self.storage.get(&self.config.namespace, key).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        stamps.retain(|t| now.saturating_sub(*t) < window_millis);

        let admit = stamps.len() + n as usize <= self.config.limit as usize;
        if admit {
            stamps.extend(std::iter::repeat(now).take(n as usize));
        }
        // Persist the pruned list either way so dead timestamps do not pile up.
        if let Err(err) = self
            .storage
            .set(
                &self.config.namespace,
                key,
                json!(stamps),
                Some(self.config.window),
            )
            .await
        {
            warn!("distributed limiter: failed to persist window for {key}: {err}");
        }
        admit
    }

    async fn allow_fixed(&self, key: &str, n: u32) -> bool {
        let now = Self::now_millis();
        let bucket_key = format!("{key}:{}", self.bucket_id(now));
        let count: u64 = match self.storage.get(&self.config.namespace, &bucket_key).await {
            Ok(value) => value.as_u64().unwrap_or(0),
            Err(_) => 0,
        };
        let new_count = count + u64::from(n);
        let ttl = Some(self.config.window * 2);
        if let Err(err) = self
            .storage
            .set(&self.config.namespace, &bucket_key, json!(new_count), ttl)
            .await
        {
            warn!("distributed limiter: failed to persist bucket for {key}: {err}");
            return false;
        }
        if new_count <= u64::from(self.config.limit) {
            return true;
        }
        // Over the limit: give the tokens back so the counter does not
        // drift upward from denied traffic.
        if let Err(err) = self
            .storage
            .set(&self.config.namespace, &bucket_key, json!(count), ttl)
            .await
        {
            warn!("distributed limiter: failed to roll back bucket for {key}: {err}");
        }
        false
    }
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    async fn allow_n(&self, key: &str, n: u32) -> bool {
        if n == 0 {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let admit = match self.config.algorithm {
            DistributedAlgorithm::SlidingWindow => self.allow_sliding(key, n).await,
            DistributedAlgorithm::FixedWindow => self.allow_fixed(key, n).await,
        };
        if admit {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        admit
    }

    async fn reserve(&self, key: &str) -> Duration {
        let now = Self::now_millis();
        match self.config.algorithm {
            DistributedAlgorithm::SlidingWindow => {
                let stamps: Vec<u64> = match self.storage.get(&self.config.namespace, key).await {
                    Ok(value) => serde_json::from_value(value).unwrap_or_default(),
                    Err(_) => Vec::new(),
                };
                let window_millis = self.config.window.as_millis() as u64;
                let live: Vec<u64> = stamps
                    .into_iter()
                    .filter(|t| now.saturating_sub(*t) < window_millis)
                    .collect();
                if (live.len() as u32) < self.config.limit {
                    Duration::ZERO
                } else {
                    live.iter()
                        .min()
                        .map(|oldest| {
                            Duration::from_millis((oldest + window_millis).saturating_sub(now))
                        })
                        .unwrap_or(Duration::ZERO)
                }
            }
            DistributedAlgorithm::FixedWindow => {
                let bucket_key = format!("{key}:{}", self.bucket_id(now));
                let count = match self.storage.get(&self.config.namespace, &bucket_key).await {
                    Ok(value) => value.as_u64().unwrap_or(0),
                    Err(_) => 0,
                };
                if count < u64::from(self.config.limit) {
                    Duration::ZERO
                } else {
                    let window_millis = self.config.window.as_millis() as u64;
                    let next_bucket = (self.bucket_id(now) + 1) * window_millis;
                    Duration::from_millis(next_bucket.saturating_sub(now))
                }
            }
        }
    }

    async fn reset(&self, key: &str) {
        let _ = self.storage.delete(&self.config.namespace, key).await;
        let bucket_key = format!("{key}:{}", self.bucket_id(Self::now_millis()));
        let _ = self
            .storage
            .delete(&self.config.namespace, &bucket_key)
            .await;
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(key);
    }

    fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            current_keys: self.locks.lock().unwrap_or_else(|e| e.into_inner()).len(),
            total_keys: self.counters.total_keys.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        // State expires through storage TTLs; nothing to cancel.
    }
}

// ---------------------------------------------------------------------------
// Sweeping helpers
// ---------------------------------------------------------------------------

fn sweep_idle<S>(
    keys: &KeyMap<S>,
    idle_ttl: Duration,
    max_keys: usize,
    last_seen: fn(&S) -> Instant,
) {
    let mut keys = keys.lock().unwrap_or_else(|e| e.into_inner());
    let now = Instant::now();
    let before = keys.len();
    keys.retain(|_, state| {
        let state = state.lock().unwrap_or_else(|e| e.into_inner());
        now.duration_since(last_seen(&state)) < idle_ttl
    });
    while keys.len() > max_keys {
        if !evict_oldest(&mut keys, last_seen) {
            break;
        }
    }
    let removed = before - keys.len();
    if removed > 0 {
        debug!("rate limiter cleanup dropped {removed} idle keys");
    }
}

fn evict_oldest<S>(
    keys: &mut HashMap<String, Arc<Mutex<S>>>,
    last_seen: fn(&S) -> Instant,
) -> bool {
    let oldest = keys
        .iter()
        .min_by_key(|(_, state)| {
            let state = state.lock().unwrap_or_else(|e| e.into_inner());
            last_seen(&state)
        })
        .map(|(k, _)| k.clone());
    match oldest {
        Some(key) => {
            keys.remove(&key);
            true
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Middleware form
// ---------------------------------------------------------------------------

/// Derives the admission key for a request.
pub type KeyFn = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Key on the message id (the default: effectively per-request).
pub fn key_by_message_id() -> KeyFn {
    Arc::new(|message: &Message| message.message_id.clone())
}

/// Key on a `user` metadata entry, falling back to `"anonymous"`.
pub fn key_by_user_metadata() -> KeyFn {
    Arc::new(|message: &Message| {
        message
            .metadata
            .get("user")
            .and_then(|v| v.as_str())
            .unwrap_or("anonymous")
            .to_string()
    })
}

/// Key on the conversation context id, falling back to `"no-context"`.
pub fn key_by_context_id() -> KeyFn {
    Arc::new(|message: &Message| {
        message
            .context_id
            .clone()
            .unwrap_or_else(|| "no-context".to_string())
    })
}

/// One shared key for every request.
pub fn key_global() -> KeyFn {
    Arc::new(|_: &Message| "global".to_string())
}

/// Synthesizes a reply for a rejected request instead of failing it.
pub type OnRejected = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Wrap a limiter as chain middleware.  A denied request yields a
/// rate-limit-exceeded error — or the `on_rejected` reply when one is
/// configured — and never reaches the wrapped handler.
pub fn rate_limit_middleware(
    limiter: Arc<dyn RateLimiter>,
    key_fn: KeyFn,
    on_rejected: Option<OnRejected>,
) -> Middleware {
    Arc::new(move |next: Handler| {
        let limiter = Arc::clone(&limiter);
        let key_fn = Arc::clone(&key_fn);
        let on_rejected = on_rejected.clone();
        Arc::new(move |info, message: Message| {
            let limiter = Arc::clone(&limiter);
            let key = key_fn(&message);
            let on_rejected = on_rejected.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                if limiter.allow(&key).await {
                    return next(info, message).await;
                }
                match on_rejected {
                    Some(synthesize) => Ok(synthesize(&message)),
                    None => Err(AgentError::rate_limited(format!("key {key:?}"))
                        .wrap("rate limit middleware")),
                }
            })
        })
    })
}
