//! TTL-based response cache used by composite routes for idempotent GETs.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use ahash::AHasher;
use tokio::sync::RwLock;

/// A cached response, keyed by a fingerprint of method + full URL.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Status code of the cached response.
    pub status_code: u16,
    /// Headers of the cached response, in insertion order.
    pub headers: Vec<(String, String)>,
    /// Cached response body. The cache owns this buffer; callers get a copy.
    pub body: Vec<u8>,
    expires_at: Instant,
}

/// Computes the cache key for `method` + `full_url` (including any query string).
pub fn fingerprint(method: &str, full_url: &str) -> u64 {
    let mut hasher = AHasher::default();
    method.hash(&mut hasher);
    full_url.hash(&mut hasher);
    hasher.finish()
}

/// A TTL-based cache of idempotent-GET responses.
///
/// Constructed with a fixed TTL applied to every entry; a zero TTL makes
/// every entry expire instantly, effectively disabling the cache without
/// requiring call sites to special-case "no cache configured".
pub struct ResponseCache {
    ttl: Duration,
    entries: RwLock<HashMap<u64, CachedResponse>>,
}

impl ResponseCache {
    /// Builds a cache with the given TTL. A zero TTL disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// True iff `method` is GET, `status` is a 2xx success, and the cache's
    /// TTL is non-zero.
    pub fn is_cacheable(&self, method: &str, status: u16) -> bool {
        method.eq_ignore_ascii_case("GET") && (200..300).contains(&status) && !self.ttl.is_zero()
    }

    /// Looks up `key`. An expired entry is treated as a miss and evicted.
    pub async fn get(&self, key: u64) -> Option<CachedResponse> {
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if entry.expires_at > Instant::now() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().await.remove(&key);
        None
    }

    /// Stores `status`/`headers`/`body` under `key`, expiring after this
    /// cache's TTL. No-op if the TTL is zero (the entry would never be served).
    pub async fn put(&self, key: u64, status_code: u16, headers: Vec<(String, String)>, body: Vec<u8>) {
        if self.ttl.is_zero() {
            return;
        }
        let entry = CachedResponse {
            status_code,
            headers,
            body,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(key, entry);
    }
}
