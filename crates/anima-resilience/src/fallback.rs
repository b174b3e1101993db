//! Named-key cache of last-known-good artifacts, the substitute source when
//! a step's real implementation fails.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    created: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl Entry {
    /// Zero TTL means the entry never expires.
    fn is_expired(&self) -> bool {
        !self.ttl.is_zero() && self.created.elapsed() > self.ttl
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStats {
    /// Entries currently held, fresh or stale.
    pub total_entries: usize,
    /// Entries past their TTL.
    pub expired_entries: usize,
    /// Entries within their TTL.
    pub active_entries: usize,
    /// Sum of per-entry hit counts.
    pub total_hits: u64,
    /// Pre-registered defaults.
    pub registered_defaults: usize,
}

/// Degraded-mode cache keyed by logical step name.
#[derive(Debug)]
pub struct FallbackCache {
    default_ttl: Duration,
    inner: Mutex<(HashMap<String, Entry>, HashMap<String, Value>)>,
}

impl FallbackCache {
    /// Create a cache with the TTL applied when `set` does not specify one.
    pub fn new(default_ttl: Duration) -> Self {
        info!(default_ttl_secs = default_ttl.as_secs_f64(), "fallback cache initialised");
        Self { default_ttl, inner: Mutex::new((HashMap::new(), HashMap::new())) }
    }

    /// Store a value under the default TTL, replacing any prior entry.
    pub fn set(&self, key: &str, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store a value with an explicit TTL. Zero means never expire.
    pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        let mut guard = self.inner.lock();
        guard.0.insert(
            key.to_string(),
            Entry { value, created: Instant::now(), ttl, hit_count: 0 },
        );
        debug!(key, ttl_secs = ttl.as_secs_f64(), "fallback entry set");
    }

    /// Pre-register a default returned when neither a fresh nor a stale
    /// entry exists for the key.
    pub fn set_default(&self, key: &str, value: Value) {
        let mut guard = self.inner.lock();
        guard.1.insert(key.to_string(), value);
        info!(key, "fallback default registered");
    }

    /// Look up a value. A hit before expiry bumps the hit count; a hit
    /// after expiry is returned (with a warning) only when `allow_expired`.
    /// Otherwise `default`, then the registered default, then `None`.
    pub fn get(&self, key: &str, default: Option<Value>, allow_expired: bool) -> Option<Value> {
        let mut guard = self.inner.lock();
        let (entries, defaults) = &mut *guard;

        let Some(entry) = entries.get_mut(key) else {
            debug!(key, "fallback miss (not found)");
            return default.or_else(|| defaults.get(key).cloned());
        };
        entry.hit_count += 1;

        if entry.is_expired() {
            if allow_expired {
                warn!(
                    key,
                    age_secs = entry.created.elapsed().as_secs_f64(),
                    ttl_secs = entry.ttl.as_secs_f64(),
                    "serving EXPIRED fallback entry"
                );
                return Some(entry.value.clone());
            }
            debug!(key, "fallback miss (expired)");
            return default.or_else(|| defaults.get(key).cloned());
        }

        debug!(key, hits = entry.hit_count, "fallback hit");
        Some(entry.value.clone())
    }

    /// Whether the key holds an entry (fresh, or any when `allow_expired`).
    pub fn has(&self, key: &str, allow_expired: bool) -> bool {
        let guard = self.inner.lock();
        guard.0.get(key).map_or(false, |e| allow_expired || !e.is_expired())
    }

    /// Remove one key.
    pub fn invalidate(&self, key: &str) {
        let mut guard = self.inner.lock();
        if guard.0.remove(key).is_some() {
            debug!(key, "fallback entry invalidated");
        }
    }

    /// Drop every entry, keeping registered defaults.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.0.clear();
    }

    /// Prune entries past their TTL; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut guard = self.inner.lock();
        let before = guard.0.len();
        guard.0.retain(|_, entry| !entry.is_expired());
        let pruned = before - guard.0.len();
        if pruned > 0 {
            info!(pruned, "expired fallback entries removed");
        }
        pruned
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> FallbackStats {
        let guard = self.inner.lock();
        let expired = guard.0.values().filter(|e| e.is_expired()).count();
        FallbackStats {
            total_entries: guard.0.len(),
            expired_entries: expired,
            active_entries: guard.0.len() - expired,
            total_hits: guard.0.values().map(|e| e.hit_count).sum(),
            registered_defaults: guard.1.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_before_ttl() {
        let cache = FallbackCache::new(Duration::from_secs(60));
        cache.set("monologue", json!("thinking about files"));
        let got = cache.get("monologue", None, false);
        assert_eq!(got, Some(json!("thinking about files")));
    }

    #[tokio::test]
    async fn expired_entry_strict_mode_falls_to_default() {
        let cache = FallbackCache::new(Duration::from_millis(30));
        cache.set_default("goal", json!({"action": "observe"}));
        cache.set("goal", json!({"action": "write"}));
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Strict mode: registered default.
        assert_eq!(cache.get("goal", None, false), Some(json!({"action": "observe"})));
        // Stale mode: the expired value is still served.
        assert_eq!(cache.get("goal", None, true), Some(json!({"action": "write"})));
    }

    #[test]
    fn explicit_default_wins_over_registered() {
        let cache = FallbackCache::new(Duration::from_secs(60));
        cache.set_default("k", json!("registered"));
        assert_eq!(cache.get("k", Some(json!("explicit")), false), Some(json!("explicit")));
        assert_eq!(cache.get("k", None, false), Some(json!("registered")));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let cache = FallbackCache::new(Duration::from_secs(60));
        cache.set_with_ttl("pin", json!(1), Duration::ZERO);
        assert!(cache.has("pin", false));
        assert_eq!(cache.get("pin", None, false), Some(json!(1)));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let cache = FallbackCache::new(Duration::from_millis(30));
        cache.set("old", json!(1));
        cache.set_with_ttl("fresh", json!(2), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.cleanup_expired(), 1);
        assert!(!cache.has("old", true));
        assert!(cache.has("fresh", false));
    }

    #[test]
    fn hit_count_accumulates() {
        let cache = FallbackCache::new(Duration::from_secs(60));
        cache.set("k", json!(0));
        cache.get("k", None, false);
        cache.get("k", None, false);
        assert_eq!(cache.stats().total_hits, 2);
    }

    #[test]
    fn missing_key_with_no_default_is_none() {
        let cache = FallbackCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("absent", None, true), None);
    }
}
