//! # Cache Store
//!
//! Pluggable string key/value store with per-entry TTL, shared by the pool
//! catalog (page results), the state synchronizer (memoised reconstructions)
//! and the aggregator (cached-state clearing on initialization).
//!
//! Values are JSON so that any backend (in-process map, Redis) stores the
//! same representation. Backend failures are never fatal to callers of
//! [`get_or_compute`]: a failed read is treated as a miss and a failed write
//! is logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisCacheStore;

/// Key/value store with TTL semantics.
///
/// A zero TTL stores the entry without expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Returns the cached value under `key`, or computes, stores and returns it.
///
/// Undecodable entries are discarded and recomputed. Errors from `compute`
/// are propagated and nothing is stored.
pub async fn get_or_compute<T, F, Fut>(
    store: &dyn CacheStore,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let namespace = key.split(':').next().unwrap_or(key);
    match store.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                debug!("Cache hit for {}", key);
                metrics::increment_cache_hit(namespace);
                return Ok(value);
            }
            Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
        },
        Ok(None) => {}
        Err(e) => warn!("Cache read for {} failed, recomputing: {}", key, e),
    }
    metrics::increment_cache_miss(namespace);

    let value = compute().await?;
    let raw = serde_json::to_string(&value)
        .with_context(|| format!("Failed to serialize cache entry {}", key))?;
    if let Err(e) = store.set_with_ttl(key, &raw, ttl).await {
        warn!("Cache write for {} failed: {}", key, e);
    }
    Ok(value)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Process-local [`CacheStore`] backed by a `DashMap`.
///
/// Expired entries are dropped lazily on read and by [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries currently held.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `key` only if the entry held now is expired; a value set
    /// since the caller's read stays.
    fn evict_if_expired(&self, key: &str, now: Instant) -> bool {
        self.entries.remove_if(key, |_, entry| !entry.is_live(now)).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.evict_if_expired(key, now);
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = InMemoryCacheStore::new();
        store
            .set_with_ttl("catalog:a", "1", Duration::from_secs(10))
            .await
            .unwrap();
        store.set_with_ttl("catalog:b", "2", Duration::ZERO).await.unwrap();

        assert_eq!(store.get("catalog:a").await.unwrap().as_deref(), Some("1"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("catalog:a").await.unwrap(), None);
        assert_eq!(store.get("catalog:b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_keeps_a_value_set_after_the_read() {
        let store = InMemoryCacheStore::new();
        store.set_with_ttl("catalog:a", "old", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let read_at = Instant::now();

        store.set_with_ttl("catalog:a", "new", Duration::from_secs(10)).await.unwrap();

        assert!(!store.evict_if_expired("catalog:a", read_at));
        assert_eq!(store.get("catalog:a").await.unwrap().as_deref(), Some("new"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.evict_if_expired("catalog:a", Instant::now()));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn get_or_compute_only_computes_on_miss() {
        let store = InMemoryCacheStore::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Vec<u64> = get_or_compute(&store, "state:x", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1, 2, 3])
            })
            .await
            .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "Value should be computed once");
    }

    #[tokio::test]
    async fn undecodable_entry_is_recomputed() {
        let store = InMemoryCacheStore::new();
        store.set_with_ttl("state:y", "not json", Duration::ZERO).await.unwrap();

        let value: u64 = get_or_compute(&store, "state:y", Duration::ZERO, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(store.get("state:y").await.unwrap().as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn failed_compute_stores_nothing() {
        let store = InMemoryCacheStore::new();
        let result: Result<u64> =
            get_or_compute(&store, "state:z", Duration::ZERO, || async { anyhow::bail!("rpc down") }).await;
        assert!(result.is_err());
        assert!(store.is_empty());
    }
}
