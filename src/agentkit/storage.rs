//! Namespaced key-value storage contract and the in-memory backend.
//!
//! Handlers, the response cache, and the distributed rate limiter all talk
//! to storage through the [`Storage`] trait so that a remote backend (Redis,
//! a relational store) can be swapped in without touching the runtime.  The
//! crate ships [`MemoryStorage`], a process-local implementation guarded by
//! a single reader-writer lock.
//!
//! TTL semantics: a `None` or zero TTL means the cell never expires.
//! Expired cells behave as missing on every read path and are removed
//! lazily the first time a reader trips over them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agentkit::error::{AgentError, Result};

/// Namespaced key-value store with TTL support.
///
/// Implementations must be safe for concurrent use; every method takes
/// `&self`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a value.  Missing or expired cells yield [`AgentError::NotFound`].
    async fn get(&self, namespace: &str, key: &str) -> Result<Value>;

    /// Store a value.  `ttl` of `None` or zero means no expiration.
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Remove a value.  Removing a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// Whether a live (non-expired) value exists.
    async fn exists(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All live keys in a namespace, in no particular order.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    /// Drop every key in a namespace.
    async fn clear(&self, namespace: &str) -> Result<()>;

    /// Remaining time to live for a key.  `Ok(None)` means the cell never
    /// expires; missing or already-expired cells yield
    /// [`AgentError::NotFound`].
    async fn ttl(&self, namespace: &str, key: &str) -> Result<Option<Duration>>;
}

fn check_ns_key(namespace: &str, key: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(AgentError::invalid_input("storage namespace must not be empty"));
    }
    if key.is_empty() {
        return Err(AgentError::invalid_input("storage key must not be empty"));
    }
    Ok(())
}

/// One stored cell: the value plus its optional expiry instant.
#[derive(Debug, Clone)]
struct StorageCell {
    value: Value,
    expires_at: Option<Instant>,
}

impl StorageCell {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`Storage`] backend.
///
/// Namespaces map to key maps behind one `RwLock`; reads that encounter an
/// expired cell upgrade to a write lock to remove it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    namespaces: RwLock<HashMap<String, HashMap<String, StorageCell>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    async fn remove_expired(&self, namespace: &str, key: &str) {
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            let now = Instant::now();
            if ns.get(key).is_some_and(|cell| cell.is_expired(now)) {
                ns.remove(key);
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Value> {
        check_ns_key(namespace, key)?;
        let expired = {
            let namespaces = self.namespaces.read().await;
            match namespaces.get(namespace).and_then(|ns| ns.get(key)) {
                Some(cell) if cell.is_expired(Instant::now()) => true,
                Some(cell) => return Ok(cell.value.clone()),
                None => false,
            }
        };
        if expired {
            self.remove_expired(namespace, key).await;
        }
        Err(AgentError::not_found(format!("{namespace}/{key}")))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        check_ns_key(namespace, key)?;
        let expires_at = match ttl {
            None => None,
            Some(d) if d.is_zero() => None,
            Some(d) => Some(Instant::now() + d),
        };
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), StorageCell { value, expires_at });
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        check_ns_key(namespace, key)?;
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        match self.get(namespace, key).await {
            Ok(_) => Ok(true),
            Err(AgentError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        if namespace.is_empty() {
            return Err(AgentError::invalid_input("storage namespace must not be empty"));
        }
        let namespaces = self.namespaces.read().await;
        let now = Instant::now();
        Ok(namespaces
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .filter(|(_, cell)| !cell.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        if namespace.is_empty() {
            return Err(AgentError::invalid_input("storage namespace must not be empty"));
        }
        let mut namespaces = self.namespaces.write().await;
        namespaces.remove(namespace);
        Ok(())
    }

    async fn ttl(&self, namespace: &str, key: &str) -> Result<Option<Duration>> {
        check_ns_key(namespace, key)?;
        let namespaces = self.namespaces.read().await;
        let now = Instant::now();
        match namespaces.get(namespace).and_then(|ns| ns.get(key)) {
            Some(cell) if cell.is_expired(now) => {
                Err(AgentError::not_found(format!("{namespace}/{key}")))
            }
            Some(cell) => Ok(cell.expires_at.map(|at| at - now)),
            None => Err(AgentError::not_found(format!("{namespace}/{key}"))),
        }
    }
}
