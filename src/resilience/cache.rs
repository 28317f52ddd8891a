//! TTL caches for resolved previews.
//!
//! [`BoundedCache`] is the storage primitive: fixed capacity, lazy expiry on
//! read, eviction of the oldest insertion when full. Capacity is a hard
//! bound; recency is approximate (reads do not refresh position).
//! [`EmbedCache`] pairs a positive cache with a shorter-lived negative cache.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::models::EmbedData;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct BoundedCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion order; may hold keys already removed from `entries`
    order: VecDeque<String>,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = Instant::now();

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
            self.order.push_back(key.clone());
        }

        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );

        if self.order.len() > self.capacity.saturating_mul(2) {
            self.compact();
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        self.compact();
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        let mut seen = std::collections::HashSet::with_capacity(entries.len());
        self.order
            .retain(|key| entries.contains_key(key) && seen.insert(key.clone()));
    }
}

/// Positive and negative preview caches keyed by `platform:url`
pub struct EmbedCache {
    positive: Mutex<BoundedCache<EmbedData>>,
    negative: Mutex<BoundedCache<()>>,
}

impl EmbedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            positive: Mutex::new(BoundedCache::new(config.ttl, config.max_entries)),
            negative: Mutex::new(BoundedCache::new(config.negative_ttl, config.max_entries)),
        }
    }

    pub fn get(&self, key: &str) -> Option<EmbedData> {
        self.positive.lock().get(key)
    }

    pub fn set(&self, key: &str, data: EmbedData) {
        self.positive.lock().insert(key, data);
    }

    pub fn set_negative(&self, key: &str) {
        self.negative.lock().insert(key, ());
    }

    pub fn is_negatively_cached(&self, key: &str) -> bool {
        self.negative.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.positive.lock().len()
    }

    /// Background sweep over both maps
    pub fn sweep(&self) -> usize {
        let positive = self.positive.lock().sweep();
        let negative = self.negative.lock().sweep();
        if positive + negative > 0 {
            debug!(positive, negative, "swept expired cache entries");
        }
        positive + negative
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbedAuthor, Platform};

    fn embed(url: &str) -> EmbedData {
        EmbedData {
            platform: Platform::Twitter,
            author: EmbedAuthor {
                name: "Artist".to_string(),
                username: "artist".to_string(),
                url: "https://twitter.com/artist".to_string(),
                icon_url: None,
            },
            text: Some("hello".to_string()),
            images: vec!["https://pbs.twimg.com/media/a.jpg".to_string()],
            videos: Vec::new(),
            color: Platform::Twitter.color(),
            original_url: url.to_string(),
            timestamp: None,
            is_nsfw: false,
            use_url_rewrite: false,
            rewritten_url: None,
        }
    }

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(10),
            max_entries,
            sweep_interval: Duration::from_secs(600),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn get_within_ttl_returns_stored_value() {
        let cache = EmbedCache::new(config(10));
        let data = embed("https://twitter.com/a/status/1");
        cache.set("twitter:1", data.clone());
        assert_eq!(cache.get("twitter:1"), Some(data));
    }

    #[tokio::test(start_paused = true)]
    async fn get_after_ttl_returns_none_and_evicts() {
        let cache = EmbedCache::new(config(10));
        cache.set("twitter:1", embed("https://twitter.com/a/status/1"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("twitter:1"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_is_never_exceeded() {
        let cache = EmbedCache::new(config(3));
        for i in 0..10 {
            cache.set(&format!("twitter:{i}"), embed(&format!("https://x/{i}")));
            assert!(cache.len() <= 3);
        }
        assert!(cache.get("twitter:0").is_none(), "oldest entry was evicted");
        assert!(cache.get("twitter:9").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn overwriting_a_key_does_not_evict() {
        let mut cache = BoundedCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(3));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_cache_sweep_empties_expired_entries() {
        let mut cache = BoundedCache::new(Duration::from_secs(5), 4);
        assert!(cache.is_empty());
        cache.insert("a", vec![1]);
        cache.insert("b", vec![2]);
        assert!(!cache.is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_entries_expire_on_their_own_ttl() {
        let cache = EmbedCache::new(config(10));
        cache.set("twitter:1", embed("https://twitter.com/a/status/1"));
        cache.set_negative("twitter:2");
        assert!(cache.is_negatively_cached("twitter:2"));
        assert!(!cache.is_negatively_cached("twitter:1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!cache.is_negatively_cached("twitter:2"));
        assert!(cache.get("twitter:1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries_from_both_maps() {
        let cache = EmbedCache::new(config(10));
        cache.set("twitter:1", embed("https://twitter.com/a/status/1"));
        cache.set_negative("twitter:2");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.sweep(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 0);
    }
}
