//! HTTP client pool for maintaining persistent connections per base URL.
//!
//! Each provider base URL gets its own `reqwest::Client` so that TCP
//! connections, TLS sessions, and DNS lookups are reused across requests.
//! Settings:
//! - `pool_idle_timeout`: keeps idle connections alive for 90 seconds
//! - `pool_max_idle_per_host`: up to 10 idle connections per host
//! - `tcp_keepalive`: keepalive probes every 60 seconds
//! - `connect_timeout`: 30 seconds to establish a connection

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    /// Global HTTP client pool, lazily initialized on first access.
    static ref HTTP_CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> =
        Mutex::new(HashMap::new());
}

/// Get or create the shared HTTP client for a base URL.
///
/// The returned client is a cheap clone sharing the underlying connection
/// pool with every other caller using the same base URL.
pub fn get_http_client(base_url: &str) -> reqwest::Client {
    let mut pool = HTTP_CLIENT_POOL.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }

    let client = build_pooled_client();
    pool.insert(base_url.to_string(), client.clone());
    client
}

/// Build a fresh client with the pooling settings above.  Also used by the
/// client SDK, which manages its own per-peer instance.
pub fn build_pooled_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
}
