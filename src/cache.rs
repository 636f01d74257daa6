// =============================================================================
// TTL Cache - in-memory memoisation for idempotent lookups
// =============================================================================
//
// Entries are replaced whole under a write lock, never merged, so readers see
// either the previous entry or the new one. Expiry is checked on every read
// (lazy eviction) and `sweep` clears stale entries in bulk; `main` runs it
// from a background interval.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Hex SHA-256 of the value's JSON serialisation. Used as a cache key for
/// request-shaped inputs.
///
/// `None` when the value cannot be serialised; callers skip caching then.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Option<String> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
        Err(e) => {
            warn!(error = %e, "value not serialisable, cache bypassed");
            None
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub enabled: bool,
    pub ttl_secs: u64,
}

/// Thread-safe TTL map keyed by string fingerprints.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    enabled: bool,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        if enabled {
            info!(ttl_secs = ttl.as_secs(), "cache enabled");
        }
        Self {
            entries: RwLock::new(HashMap::new()),
            enabled,
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Return a live entry, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }
        {
            let map = self.entries.read();
            match map.get(key) {
                None => return None,
                Some(entry) if entry.expires_at > Instant::now() => {
                    debug!(key, "cache hit");
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }
        let mut map = self.entries.write();
        // Re-check under the write lock; a writer may have refreshed it.
        if let Some(entry) = map.get(key) {
            if entry.expires_at <= Instant::now() {
                map.remove(key);
                debug!(key, "cache entry expired");
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let key = key.into();
        debug!(key = %key, ttl_secs = ttl.as_secs(), "cache set");
        self.entries.write().insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn clear(&self) {
        let mut map = self.entries.write();
        let size = map.len();
        map.clear();
        if size > 0 {
            info!(removed = size, "cache cleared");
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.write();
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.read().len(),
            enabled: self.enabled,
            ttl_secs: self.ttl.as_secs(),
        }
    }
}
