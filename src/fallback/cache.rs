//! Process-local TTL cache used while the backend is unreachable.

use crate::config::{CacheConfig, DurationExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
    created_at: Instant,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently stored (including not-yet-purged expired ones)
    pub entries: usize,
    /// Capacity
    pub max_size: usize,
    /// Successful lookups
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries dropped to make room
    pub evictions: u64,
    /// Age of the oldest stored entry
    pub oldest_entry_secs: Option<u64>,
    /// hits / (hits + misses), 0 when unused
    pub hit_rate: f64,
}

/// Bounded in-memory cache with per-entry TTL and LRU eviction
#[derive(Debug)]
pub struct MemoryFallbackCache {
    state: Mutex<CacheState>,
    max_size: usize,
    default_ttl: Duration,
}

impl MemoryFallbackCache {
    /// Create a cache sized by the configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.max_size, config.default_ttl_secs.secs())
    }

    /// Create a cache with explicit limits
    pub fn with_capacity(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// Look up a live entry; expired entries are removed on the way
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expired = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed = now;
                let value = entry.value.clone();
                state.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(key);
        }
        state.misses += 1;
        None
    }

    /// Store a value; `None` uses the default TTL
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_size {
            self.make_room(&mut state, now);
        }

        state.entries.insert(
            key,
            CacheEntry {
                value: value.into(),
                expires_at: now + ttl,
                created_at: now,
                last_accessed: now,
            },
        );
    }

    fn make_room(&self, state: &mut CacheState, now: Instant) {
        state.entries.retain(|_, entry| !entry.is_expired(now));
        if state.entries.len() < self.max_size {
            return;
        }

        let evict = (self.max_size / 10).max(1);
        let mut by_access: Vec<(Instant, String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_accessed, key.clone()))
            .collect();
        by_access.sort_unstable();

        for (_, key) in by_access.into_iter().take(evict) {
            state.entries.remove(&key);
        }
        state.evictions += evict as u64;
        tracing::debug!(evicted = evict, "Fallback cache full, evicted least recently used entries");
    }

    /// Remove an entry; `true` if it existed
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Drop every entry (counters are kept)
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            oldest_entry_secs: state
                .entries
                .values()
                .map(|entry| entry.created_at.elapsed().as_secs())
                .max(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = MemoryFallbackCache::with_capacity(10, Duration::from_secs(60));
        cache.set("a", "1", None);
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert_eq!(cache.get("b"), None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_entries_expire_lazily() {
        let cache = MemoryFallbackCache::with_capacity(10, Duration::from_secs(60));
        cache.set("short", "v", Some(Duration::from_millis(10)));
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let cache = MemoryFallbackCache::with_capacity(20, Duration::from_secs(60));
        for i in 0..20 {
            cache.set(format!("k{i}"), "v", None);
            std::thread::sleep(Duration::from_millis(1));
        }
        // Touch the two oldest so they survive
        assert!(cache.get("k0").is_some());
        assert!(cache.get("k1").is_some());

        cache.set("new", "v", None);

        // 10% of 20 = 2 evicted, then one inserted
        assert_eq!(cache.len(), 19);
        assert_eq!(cache.stats().evictions, 2);
        assert!(cache.get("k0").is_some());
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k2").is_none());
        assert!(cache.get("k3").is_none());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn test_expired_entries_are_purged_before_evicting() {
        let cache = MemoryFallbackCache::with_capacity(3, Duration::from_secs(60));
        cache.set("stale", "v", Some(Duration::from_millis(5)));
        cache.set("a", "v", None);
        cache.set("b", "v", None);
        std::thread::sleep(Duration::from_millis(10));

        cache.set("c", "v", None);
        assert_eq!(cache.stats().evictions, 0);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = MemoryFallbackCache::with_capacity(2, Duration::from_secs(60));
        cache.set("a", "1", None);
        cache.set("b", "1", None);
        cache.set("a", "2", None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some("2".to_string()));
    }
}
