//! Status Cache (C3).
//!
//! Keyed by `(namespace, key)` with a per-entry TTL. Grounded on the same
//! shared-map-behind-a-lock shape as the timing system's `StreamCounts`, but
//! adds expiry and a `get_or_compute` memoizer around an arbitrary async call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Point-in-time counters for `stats()`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub entries_cleaned: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<(String, String), Entry>,
    hits: u64,
    misses: u64,
    entries_cleaned: u64,
}

/// Concurrent-safe TTL cache. Cloning shares the backing store.
#[derive(Clone, Default)]
pub struct StatusCache {
    inner: Arc<RwLock<Inner>>,
}

impl StatusCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value, treating an expired entry as a miss (and reclaiming it).
    pub fn get(&self, ns: &str, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let k = (ns.to_owned(), key.to_owned());
        let mut inner = self.inner.write().unwrap();
        match inner.entries.get(&k) {
            Some(entry) if entry.is_live(now) => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            Some(_) => {
                inner.entries.remove(&k);
                inner.entries_cleaned += 1;
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Overwrite (or insert) a value with an absolute TTL from now.
    pub fn set(&self, ns: &str, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut inner = self.inner.write().unwrap();
        inner.entries.insert(
            (ns.to_owned(), key.to_owned()),
            Entry { value, expires_at: Instant::now() + ttl },
        );
    }

    /// Return the cached value if present and unexpired; otherwise compute it
    /// via `f`, memoize under `ttl`, and return it.
    ///
    /// Concurrent calls on the same key may both miss and both compute —
    /// thundering-herd deduplication is explicitly not guaranteed (§4.2).
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        ns: &str,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        if let Some(v) = self.get(ns, key) {
            return Ok(v);
        }
        let value = f().await?;
        self.set(ns, key, value.clone(), ttl);
        Ok(value)
    }

    /// Remove a single entry if present.
    pub fn invalidate(&self, ns: &str, key: &str) {
        self.inner.write().unwrap().entries.remove(&(ns.to_owned(), key.to_owned()));
    }

    /// Remove every entry in a namespace.
    pub fn invalidate_namespace(&self, ns: &str) {
        self.inner.write().unwrap().entries.retain(|(entry_ns, _), _| entry_ns != ns);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            entries_cleaned: inner.entries_cleaned,
        }
    }
}
