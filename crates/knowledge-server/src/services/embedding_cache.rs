use crate::config::CacheConfig;
use crate::utils::hashing::sha256_hex;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct CachedEmbedding {
    embedding: Vec<f32>,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Embedding memoisation keyed by SHA-256 of the content. Hits refresh
/// access metadata; capacity overflow evicts the least-recently-used entry
/// and a periodic sweep removes entries past their TTL.
pub struct EmbeddingCache {
    enabled: bool,
    max_items: usize,
    ttl: Duration,
    store: DashMap<String, CachedEmbedding>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl EmbeddingCache {
    pub fn new(config: &CacheConfig) -> Self {
        info!(
            enabled = config.enabled,
            max_items = config.max_items,
            ttl_hours = config.ttl_hours,
            "Initializing embedding cache"
        );
        Self {
            enabled: config.enabled,
            max_items: config.max_items.max(1),
            ttl: Duration::from_secs(config.ttl_hours * 3600),
            store: DashMap::new(),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn key_for(content: &str) -> String {
        sha256_hex(content)
    }

    /// A disabled cache always misses.
    pub fn try_get(&self, content: &str) -> Option<Vec<f32>> {
        use std::sync::atomic::Ordering;

        if !self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let key = Self::key_for(content);
        let mut entry = match self.store.get_mut(&key) {
            Some(entry) => entry,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.created_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(&key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.last_access = Instant::now();
        entry.access_count += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %&key[..8], "Embedding cache hit");
        Some(entry.embedding.clone())
    }

    /// A disabled cache makes `set` a no-op.
    pub fn set(&self, content: &str, embedding: Vec<f32>) {
        if !self.enabled {
            return;
        }

        let key = Self::key_for(content);
        let now = Instant::now();
        self.store.insert(
            key,
            CachedEmbedding {
                embedding,
                created_at: now,
                last_access: now,
                access_count: 0,
            },
        );

        while self.store.len() > self.max_items {
            self.evict_lru();
        }
    }

    /// Least-recently-used by (last_access, access_count).
    fn evict_lru(&self) {
        let victim = self
            .store
            .iter()
            .min_by_key(|entry| (entry.value().last_access, entry.value().access_count))
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            self.store.remove(&key);
            debug!(key = %&key[..8], "Evicted LRU embedding");
        }
    }

    /// Remove entries past their TTL; returns how many went.
    pub fn sweep_expired(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        let before = self.store.len();
        let ttl = self.ttl;
        self.store.retain(|_, entry| entry.created_at.elapsed() <= ttl);
        let removed = before - self.store.len();
        if removed > 0 {
            debug!(removed, "Swept expired embeddings");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        use std::sync::atomic::Ordering;
        CacheStats {
            entries: self.store.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(enabled: bool, max_items: usize, ttl_hours: u64) -> EmbeddingCache {
        EmbeddingCache::new(&CacheConfig {
            enabled,
            max_items,
            ttl_hours,
            sweep_interval_seconds: 300,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn get_after_set_returns_same_vector() {
        let cache = cache(true, 10, 1);
        cache.set("hello world", vec![0.1, 0.2, 0.3]);

        assert_eq!(cache.try_get("hello world"), Some(vec![0.1, 0.2, 0.3]));
        // A different content never returns another content's vector.
        assert_eq!(cache.try_get("hello worlds"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_cache_always_misses() {
        let cache = cache(false, 10, 1);
        cache.set("hello", vec![1.0]);
        assert_eq!(cache.try_get("hello"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_overflow_evicts_least_recently_used() {
        let cache = cache(true, 2, 1);
        cache.set("a", vec![1.0]);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("b", vec![2.0]);
        tokio::time::advance(Duration::from_secs(1)).await;

        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.try_get("a").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;

        cache.set("c", vec![3.0]);
        assert_eq!(cache.len(), 2);
        assert!(cache.try_get("a").is_some());
        assert!(cache.try_get("b").is_none(), "LRU entry must be evicted");
        assert!(cache.try_get("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_miss_and_sweep() {
        let cache = cache(true, 10, 1);
        cache.set("old", vec![1.0]);

        tokio::time::advance(Duration::from_secs(3601)).await;
        cache.set("fresh", vec![2.0]);

        assert_eq!(cache.try_get("old"), None, "expired entry must miss");
        assert_eq!(cache.sweep_expired(), 0, "lazy miss already removed it");
        assert!(cache.try_get("fresh").is_some());

        cache.set("another", vec![3.0]);
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(cache.sweep_expired(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_hits_and_misses() {
        let cache = cache(true, 10, 1);
        cache.set("x", vec![1.0]);
        let _ = cache.try_get("x");
        let _ = cache.try_get("x");
        let _ = cache.try_get("y");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }
}
