//! TTL-bounded, size-capped response cache.
//!
//! Entries are immutable once inserted. Expiry is lazy: a stale entry is
//! removed on the next lookup, and [`ResponseCache::sweep_expired`] can
//! reclaim entries nobody asks for again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default time-to-live for cached responses.
pub const DEFAULT_TTL_SECS: u64 = 500;

/// Default cap on the size of a single cached response.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 1024 * 1024;

/// Cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live of every entry, in seconds.
    pub ttl_secs: u64,
    /// Entries must be strictly smaller than this many bytes.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
        }
    }
}

impl CacheConfig {
    /// Returns the TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// A cached response.
#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Bytes,
    expires_at: Instant,
}

/// Shared response cache keyed by normalised request URL.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResponseCache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up `key`, dropping the entry if it has expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_at(key, Instant::now())
    }

    /// Looks up `key` as of `now`.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                tracing::debug!(key, "cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Stores `payload` under `key` with a fresh TTL.
    ///
    /// Returns false (and stores nothing) when the payload is not under the
    /// size cap.
    pub fn put(&self, key: impl Into<String>, payload: impl Into<Bytes>) -> bool {
        self.put_at(key, payload, Instant::now())
    }

    /// Stores `payload` as of `now`.
    pub fn put_at(&self, key: impl Into<String>, payload: impl Into<Bytes>, now: Instant) -> bool {
        let payload = payload.into();
        if payload.len() >= self.config.max_entry_size {
            return false;
        }

        let key = key.into();
        tracing::debug!(key = %key, bytes = payload.len(), "cache store");
        self.entries.lock().insert(
            key,
            CacheEntry {
                payload,
                expires_at: now + self.config.ttl(),
            },
        );
        true
    }

    /// Removes `key`. Returns true if an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Removes every entry that has expired as of `now`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total payload bytes held.
    pub fn size_bytes(&self) -> usize {
        self.entries.lock().values().map(|e| e.payload.len()).sum()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig {
            ttl_secs: 500,
            max_entry_size: 16,
        })
    }

    #[test]
    fn get_returns_fresh_entry() {
        let cache = cache();
        assert!(cache.put("http://a/", &b"hello"[..]));
        assert_eq!(cache.get("http://a/").as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn miss_for_unknown_key() {
        assert!(cache().get("http://nope/").is_none());
    }

    #[test]
    fn expired_entry_is_absent_and_removed() {
        let cache = cache();
        let now = Instant::now();
        cache.put_at("k", &b"v"[..], now);

        let later = now + Duration::from_secs(499);
        assert!(cache.get_at("k", later).is_some());

        let expired = now + Duration::from_secs(500);
        assert!(cache.get_at("k", expired).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let cache = cache();
        assert!(!cache.put("big", vec![0u8; 16]));
        assert!(cache.put("fits", vec![0u8; 15]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_overwrites_with_fresh_ttl() {
        let cache = cache();
        let t0 = Instant::now();
        cache.put_at("k", &b"one"[..], t0);

        let t1 = t0 + Duration::from_secs(400);
        cache.put_at("k", &b"two"[..], t1);

        let t2 = t0 + Duration::from_secs(600);
        assert_eq!(cache.get_at("k", t2).as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = cache();
        let t0 = Instant::now();
        cache.put_at("old", &b"1"[..], t0);
        cache.put_at("new", &b"2"[..], t0 + Duration::from_secs(300));

        let removed = cache.sweep_expired(t0 + Duration::from_secs(501));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 1);
    }
}
