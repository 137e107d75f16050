//! Shared TTL cache used by the auth pipeline (token reviews, subject
//! access reviews) and the discovery cache.
//!
//! Grounded on `other_examples/…octofhir-server-rs…policy-cache.rs`: a
//! single `Arc<RwLock<HashMap<…>>>`, lazy expiry on read, no background
//! sweeper. Generalized here to the spec's positive/negative-entry shape
//! (`spec.md` §3 `CacheEntry`, §5 "Cache discipline"): a miss is computed
//! by the caller and stored under either the positive or negative TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// A cached value: a real payload, or the negative sentinel (`spec.md`
/// §3: "The sentinel `false` denotes a negative result with its own
/// TTL").
#[derive(Debug, Clone)]
pub enum CachedValue<T> {
    Positive(T),
    Negative,
}

impl<T> CachedValue<T> {
    pub fn as_positive(&self) -> Option<&T> {
        match self {
            CachedValue::Positive(v) => Some(v),
            CachedValue::Negative => None,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, CachedValue::Negative)
    }
}

struct Entry<T> {
    value: CachedValue<T>,
    expires_at: Instant,
}

/// A mutex-guarded map of `key -> CacheEntry`, read-lock on lookup,
/// write-lock on insert, lazily expired on read — exactly `spec.md` §5's
/// "Cache discipline": "Reads take a read lock; writes take a write
/// lock. Entries are lazily expired on read; no background sweeper is
/// required."
#[derive(Clone)]
pub struct TtlCache<T: Clone> {
    positive_ttl: Duration,
    negative_ttl: Duration,
    entries: Arc<RwLock<HashMap<String, Entry<T>>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(positive_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            positive_ttl,
            negative_ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Look up `key`. Returns `None` on miss or on lazy expiry.
    pub async fn get(&self, key: &str) -> Option<CachedValue<T>> {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            if let Some(entry) = guard.get(key) {
                if entry.expires_at > now {
                    return Some(entry.value.clone());
                }
            } else {
                return None;
            }
        }
        // Expired: drop it under a write lock (still "lazy": only happens
        // on a read that observes staleness, never via a background task).
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get(key) {
            if entry.expires_at <= now {
                guard.remove(key);
            }
        }
        None
    }

    pub async fn put_positive(&self, key: impl Into<String>, value: T) {
        let mut guard = self.entries.write().await;
        guard.insert(
            key.into(),
            Entry {
                value: CachedValue::Positive(value),
                expires_at: Instant::now() + self.positive_ttl,
            },
        );
    }

    pub async fn put_negative(&self, key: impl Into<String>) {
        let mut guard = self.entries.write().await;
        guard.insert(
            key.into(),
            Entry {
                value: CachedValue::Negative,
                expires_at: Instant::now() + self.negative_ttl,
            },
        );
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_returns_none() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), Duration::from_secs(5));
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn positive_hit_returns_value() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), Duration::from_secs(5));
        cache.put_positive("k", "v".to_string()).await;
        let hit = cache.get("k").await.unwrap();
        assert_eq!(hit.as_positive(), Some(&"v".to_string()));
    }

    #[tokio::test]
    async fn negative_hit_short_circuits() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), Duration::from_secs(5));
        cache.put_negative("bad-token").await;
        let hit = cache.get("bad-token").await.unwrap();
        assert!(hit.is_negative());
    }

    #[tokio::test]
    async fn expired_entry_behaves_as_miss() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_millis(5), Duration::from_millis(5));
        cache.put_positive("k", "v".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn independent_positive_and_negative_ttls() {
        let cache: TtlCache<String> =
            TtlCache::new(Duration::from_secs(60), Duration::from_millis(5));
        cache.put_negative("k").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.is_none());
    }
}
