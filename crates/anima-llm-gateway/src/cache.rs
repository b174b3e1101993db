//! LRU + TTL cache for model responses, keyed by a hash of the system and
//! user prompts. Expired entries are removed on access; eviction is
//! least-recently-used within a fixed capacity.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug)]
struct Entry {
    value: String,
    created: Instant,
    access_count: u64,
}

impl Entry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() > ttl
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses (including expirations).
    pub misses: u64,
    /// Hit percentage.
    pub hit_rate: f64,
    /// LRU evictions.
    pub evictions: u64,
    /// TTL expirations.
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Response cache. The `IndexMap` insertion order doubles as the recency
/// order: hits are moved to the back, evictions pop the front.
#[derive(Debug)]
pub struct ResponseCache {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<(IndexMap<u64, Entry>, Counters)>,
}

impl ResponseCache {
    /// Create a cache with the given capacity and entry time-to-live.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        info!(max_size, ttl_secs = ttl.as_secs_f64(), "response cache initialised");
        Self { max_size, ttl, inner: Mutex::new((IndexMap::new(), Counters::default())) }
    }

    fn key(prompt: &str, system: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        system.hash(&mut hasher);
        "||".hash(&mut hasher);
        prompt.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up a cached response. Expired entries are removed and count as
    /// misses.
    pub fn get(&self, prompt: &str, system: &str) -> Option<String> {
        let key = Self::key(prompt, system);
        let mut guard = self.inner.lock();
        let (map, counters) = &mut *guard;

        let Some(entry) = map.get(&key) else {
            counters.misses += 1;
            return None;
        };
        if entry.is_expired(self.ttl) {
            map.shift_remove(&key);
            counters.expirations += 1;
            counters.misses += 1;
            debug!(key, "cache entry expired");
            return None;
        }

        // Move to the back of the recency order.
        let mut entry = map.shift_remove(&key).unwrap_or_else(|| unreachable!());
        entry.access_count += 1;
        let value = entry.value.clone();
        map.insert(key, entry);
        counters.hits += 1;
        Some(value)
    }

    /// Store a response. Empty responses are not cached. A full cache
    /// evicts its least-recently-used entry.
    pub fn set(&self, prompt: &str, system: &str, response: &str) {
        if response.is_empty() {
            return;
        }
        let key = Self::key(prompt, system);
        let mut guard = self.inner.lock();
        let (map, counters) = &mut *guard;

        if !map.contains_key(&key) && map.len() >= self.max_size {
            map.shift_remove_index(0);
            counters.evictions += 1;
        }
        map.shift_remove(&key);
        map.insert(
            key,
            Entry { value: response.to_string(), created: Instant::now(), access_count: 0 },
        );
    }

    /// Remove all expired entries; returns how many were pruned.
    pub fn cleanup_expired(&self) -> usize {
        let mut guard = self.inner.lock();
        let (map, counters) = &mut *guard;
        let before = map.len();
        let ttl = self.ttl;
        map.retain(|_, entry| !entry.is_expired(ttl));
        let pruned = before - map.len();
        counters.expirations += pruned as u64;
        if pruned > 0 {
            info!(pruned, "expired cache entries removed");
        }
        pruned
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.0.clear();
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock();
        let (map, counters) = &*guard;
        let total = counters.hits + counters.misses;
        let hit_rate = if total > 0 {
            counters.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            size: map.len(),
            max_size: self.max_size,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: (hit_rate * 100.0).round() / 100.0,
            evictions: counters.evictions,
            expirations: counters.expirations,
        }
    }
}
