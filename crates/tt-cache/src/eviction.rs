//! LRU store for compiled executables.
//!
//! Entries are keyed by signature [`CacheKey`]. Lookups move the entry to
//! the most-recently-used position; inserts beyond `max_entries` drop the
//! least-recently-used entry.

use crate::CacheKey;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Configuration for LRU eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruConfig {
    /// Maximum number of entries before eviction triggers. Zero disables caching.
    pub max_entries: usize,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self { max_entries: 16 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
}

#[derive(Debug)]
pub struct ExecutableCache<V> {
    entries: FxHashMap<CacheKey, V>,
    config: LruConfig,
    /// Access-ordered queue: front = least recently used, back = most recent.
    order: VecDeque<CacheKey>,
    stats: CacheStats,
}

impl<V> Default for ExecutableCache<V> {
    fn default() -> Self {
        Self::new(LruConfig::default())
    }
}

impl<V> ExecutableCache<V> {
    #[must_use]
    pub fn new(config: LruConfig) -> Self {
        Self {
            entries: FxHashMap::default(),
            config,
            order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    /// Move a key to the most-recently-used position.
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    /// Look up an entry, recording a hit or miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.stats.hits += 1;
            self.touch(key);
            self.entries.get(key)
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Look up without touching order or stats.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<&V> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry, returning the keys evicted to stay in budget.
    pub fn insert(&mut self, key: CacheKey, value: V) -> Vec<CacheKey> {
        self.touch(&key);
        self.entries.insert(key, value);
        self.enforce_budget()
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        self.order.retain(|k| k != key);
        self.entries.remove(key)
    }

    fn enforce_budget(&mut self) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.order.len() > self.config.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                log::debug!("evicted executable {oldest}");
                self.stats.evictions += 1;
                evicted.push(oldest);
            }
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn config(&self) -> &LruConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len(),
            ..self.stats
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(digest: &str) -> CacheKey {
        CacheKey {
            namespace: "ttx",
            digest_hex: digest.to_owned(),
        }
    }

    #[test]
    fn lru_evicts_oldest_when_over_max_entries() {
        let mut cache = ExecutableCache::new(LruConfig { max_entries: 2 });

        assert!(cache.insert(test_key("a"), 1).is_empty());
        assert!(cache.insert(test_key("b"), 2).is_empty());
        assert_eq!(cache.stats().entry_count, 2);

        let evicted = cache.insert(test_key("c"), 3);
        assert_eq!(evicted, vec![test_key("a")]);
        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&test_key("a")).is_none(), "oldest should be evicted");
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = ExecutableCache::new(LruConfig { max_entries: 2 });
        cache.insert(test_key("a"), "a");
        cache.insert(test_key("b"), "b");
        assert_eq!(cache.get(&test_key("a")), Some(&"a"));

        cache.insert(test_key("c"), "c");
        assert!(cache.contains(&test_key("a")));
        assert!(!cache.contains(&test_key("b")));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let mut cache = ExecutableCache::new(LruConfig::default());
        cache.insert(test_key("a"), 0_u8);
        let _ = cache.get(&test_key("a"));
        let _ = cache.get(&test_key("a"));
        let _ = cache.get(&test_key("zz"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn reinserting_a_key_replaces_without_growth() {
        let mut cache = ExecutableCache::new(LruConfig { max_entries: 4 });
        cache.insert(test_key("a"), 1);
        cache.insert(test_key("a"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&test_key("a")), Some(&2));
    }

    #[test]
    fn zero_budget_keeps_nothing() {
        let mut cache = ExecutableCache::new(LruConfig { max_entries: 0 });
        let evicted = cache.insert(test_key("a"), 1);
        assert_eq!(evicted.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_and_remove_reset_entries() {
        let mut cache = ExecutableCache::new(LruConfig::default());
        cache.insert(test_key("a"), 1);
        cache.insert(test_key("b"), 2);
        assert_eq!(cache.remove(&test_key("a")), Some(1));
        cache.clear();
        assert_eq!(cache.stats().entry_count, 0);
    }
}
