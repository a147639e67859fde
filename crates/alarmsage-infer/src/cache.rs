//! LRU cache for query embeddings.
//!
//! Repeated searches (the same alarm description, the same manual question)
//! skip the embedding round-trip. Default: 1000 entries, 1-hour TTL.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use ndarray::Array1;
use parking_lot::Mutex;

struct CacheEntry {
    embedding: Array1<f32>,
    inserted_at: Instant,
}

/// Thread-safe LRU cache keyed by the exact query text.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Least recently used at the front.
    order: VecDeque<String>,
    max_size: usize,
    ttl: Duration,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn evict(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(max_size),
                order: VecDeque::with_capacity(max_size),
                max_size: max_size.max(1),
                ttl,
            }),
        }
    }

    pub fn default_cache() -> Self {
        Self::new(1000, Duration::from_secs(3600))
    }

    /// Cached embedding for `query`, or None on miss or expiry.
    pub fn get(&self, query: &str) -> Option<Array1<f32>> {
        let mut inner = self.inner.lock();
        let ttl = inner.ttl;
        let (embedding, expired) = match inner.entries.get(query) {
            Some(entry) => (entry.embedding.clone(), entry.inserted_at.elapsed() >= ttl),
            None => return None,
        };
        if expired {
            inner.evict(query);
            return None;
        }
        inner.touch(query);
        Some(embedding)
    }

    pub fn put(&self, query: String, embedding: Array1<f32>) {
        let mut inner = self.inner.lock();
        let entry = CacheEntry {
            embedding,
            inserted_at: Instant::now(),
        };

        if inner.entries.contains_key(&query) {
            inner.entries.insert(query.clone(), entry);
            inner.touch(&query);
            return;
        }

        while inner.entries.len() >= inner.max_size {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(query.clone());
        inner.entries.insert(query, entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_hit_and_miss() {
        let cache = QueryCache::new(10, Duration::from_secs(3600));
        assert!(cache.get("SW0100").is_none());

        cache.put("SW0100".into(), array![1.0, 2.0, 3.0]);
        assert_eq!(cache.get("SW0100"), Some(array![1.0, 2.0, 3.0]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = QueryCache::new(2, Duration::from_secs(3600));
        cache.put("a".into(), array![1.0]);
        cache.put("b".into(), array![2.0]);
        // Reading "a" makes "b" the eviction candidate.
        assert!(cache.get("a").is_some());

        cache.put("c".into(), array![3.0]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = QueryCache::new(10, Duration::from_millis(1));
        cache.put("ephemeral".into(), array![1.0]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("ephemeral").is_none());
        assert!(cache.is_empty());
    }
}
