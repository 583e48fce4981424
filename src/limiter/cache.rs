//! Bounded LRU result cache with per-entry expiry.

use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Argument keys that never affect the result and would defeat caching.
const VOLATILE_KEYS: &[&str] = &["timestamp", "nonce", "requestId", "request_id", "fileName", "file_name"];

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub result: T,
    pub computed_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct ResultCache<T> {
    entries: LruCache<String, CacheEntry<T>>,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Fetch a live entry, promoting it. Expired entries are dropped on sight.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<CacheEntry<T>> {
        let expired = match self.entries.get(key) {
            Some(entry) if now <= entry.expires_at => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
        }
        None
    }

    /// Insert, evicting the least recently used entry at capacity.
    pub fn put(&mut self, key: String, result: T, ttl: Duration, now: Instant) {
        self.entries.put(
            key,
            CacheEntry {
                result,
                computed_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Stable key for `operation` + arguments, ignoring volatile fields.
pub fn cache_key(operation: &str, args: &Value) -> String {
    let normalized = normalize(args);
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Strip volatile keys recursively. Object keys serialize sorted, so the
/// resulting string is canonical.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}
