//! Fingerprint-keyed response cache.
//!
//! The cache short-circuits repeated identical requests with a previously
//! computed reply.  A request's fingerprint is the hex SHA-256 of the JSON
//! serialization of its role, ordered text parts, and context id — so two
//! requests differing in any of the three never collide on purpose, while
//! retransmissions of the same question hit.
//!
//! Eviction is policy-driven (LRU, LFU, FIFO, or TTL sweep); every entry
//! additionally carries an absolute expiry, and an expired entry found by a
//! lookup counts as a miss and is deleted on the spot.  All state lives
//! behind a single mutex, so the map and the recency list can never drift
//! apart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::agentkit::error::Result;
use crate::agentkit::message::{Message, Role};
use crate::agentkit::middleware::{Handler, Middleware};

/// Which entry gets evicted when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Remove the least-recently accessed entry.
    #[default]
    Lru,
    /// Remove the least-frequently accessed entry.
    Lfu,
    /// Remove the oldest inserted entry.
    Fifo,
    /// Sweep all expired entries; fall back to the soonest-expiring one.
    Ttl,
}

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_entries: usize,
    /// Time-to-live applied to every inserted reply.
    pub ttl: Duration,
    /// Eviction policy applied when an insert finds the cache full.
    pub policy: EvictionPolicy,
    /// Cache only user-role requests.  On by default: agent, system, and
    /// tool traffic is not request/reply shaped.
    pub user_messages_only: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 1000,
            ttl: Duration::from_secs(300),
            policy: EvictionPolicy::Lru,
            user_messages_only: true,
        }
    }
}

/// Counters exposed by [`ResponseCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry).
    pub misses: u64,
    /// Successful inserts.
    pub sets: u64,
    /// Explicit invalidations.
    pub deletes: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Live entries right now.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
}

impl CacheStats {
    /// Hits over total lookups; zero when nothing was looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    reply: Message,
    expires_at: Instant,
    access_count: u64,
    inserted_seq: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Recency list, least-recently-used at the front.  FIFO leaves it
    /// untouched on reads; LRU promotes.
    order: VecDeque<String>,
    insert_seq: u64,
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
}

impl CacheInner {
    fn detach(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }

    fn remove_entry(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.detach(key);
            true
        } else {
            false
        }
    }

    /// Pick and remove one victim according to the policy.  Returns false
    /// when there was nothing to evict.
    fn evict_one(&mut self, policy: EvictionPolicy, now: Instant) -> bool {
        let victim = match policy {
            EvictionPolicy::Lru | EvictionPolicy::Fifo => self.order.front().cloned(),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.inserted_seq))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Ttl => {
                let expired: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(_, e)| e.expires_at <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                if !expired.is_empty() {
                    for key in &expired {
                        self.remove_entry(key);
                    }
                    self.evictions += expired.len() as u64;
                    return true;
                }
                self.entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
            }
        };
        match victim {
            Some(key) => {
                self.remove_entry(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

/// Thread-safe response cache.  Share it via `Arc`; every operation takes
/// `&self`.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

/// Compute the canonical request fingerprint: hex SHA-256 over the JSON of
/// role, ordered text parts, and context id.
pub fn fingerprint(message: &Message) -> String {
    let texts: Vec<&str> = message
        .parts
        .iter()
        .filter_map(|p| p.as_text())
        .collect();
    let canonical = json!({
        "role": message.role.as_str(),
        "texts": texts,
        "contextId": message.context_id,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        ResponseCache {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Whether this request is eligible for caching under the configured
    /// policy.
    pub fn should_cache(&self, message: &Message) -> bool {
        !self.config.user_messages_only || message.role == Role::User
    }

    /// Look up a cached reply.  An expired entry is deleted and counted as
    /// a miss.  LRU promotes the entry to most-recently-used.
    pub fn get(&self, message: &Message) -> Option<Message> {
        if !self.should_cache(message) {
            return None;
        }
        let key = fingerprint(message);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        // Resolve the lookup before touching any counters so the map
        // borrow ends here.
        let expired = inner.entries.get(&key).map(|entry| entry.expires_at <= now);
        match expired {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(true) => {
                inner.remove_entry(&key);
                inner.misses += 1;
                return None;
            }
            Some(false) => {}
        }

        inner.hits += 1;
        let reply = inner.entries.get_mut(&key).map(|entry| {
            entry.access_count += 1;
            entry.reply.clone()
        });
        if self.config.policy == EvictionPolicy::Lru {
            inner.detach(&key);
            inner.order.push_back(key);
        }
        reply
    }

    /// Insert a reply for a request.  A full cache evicts first, then
    /// inserts; requests the policy filters out are ignored.
    pub fn set(&self, message: &Message, reply: Message) -> Result<()> {
        if !self.should_cache(message) {
            return Ok(());
        }
        let key = fingerprint(message);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        // Overwriting an existing fingerprint is an update, not a grow.
        if inner.entries.contains_key(&key) {
            inner.remove_entry(&key);
        }
        while inner.entries.len() >= self.config.max_entries {
            if !inner.evict_one(self.config.policy, now) {
                break;
            }
        }

        inner.insert_seq += 1;
        let seq = inner.insert_seq;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                reply,
                expires_at: now + self.config.ttl,
                access_count: 0,
                inserted_seq: seq,
            },
        );
        inner.order.push_back(key);
        inner.sets += 1;
        Ok(())
    }

    /// Remove the entry for a request, if present.
    pub fn invalidate(&self, message: &Message) -> Result<()> {
        let key = fingerprint(message);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.remove_entry(&key) {
            inner.deletes += 1;
        }
        Ok(())
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.order.clear();
        inner.deletes += removed;
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            deletes: inner.deletes,
            evictions: inner.evictions,
            size: inner.entries.len(),
            max_size: self.config.max_entries,
        }
    }
}

/// Wrap a cache as chain middleware: a hit returns the cached reply
/// without calling `next`; a miss calls through and inserts the result.
/// Errors from `next` never populate the cache, and a failed cache write
/// is logged rather than failing the reply.
pub fn cache_middleware(cache: Arc<ResponseCache>) -> Middleware {
    Arc::new(move |next: Handler| {
        let cache = Arc::clone(&cache);
        Arc::new(move |info, message: Message| {
            let cache = Arc::clone(&cache);
            let next = Arc::clone(&next);
            Box::pin(async move {
                if let Some(reply) = cache.get(&message) {
                    return Ok(reply);
                }
                let reply = next(info, message.clone()).await?;
                if let Err(err) = cache.set(&message, reply.clone()) {
                    warn!("cache write failed for {}: {err}", message.message_id);
                }
                Ok(reply)
            })
        })
    })
}
