//! In-memory response cache.
//!
//! Short-lived memoization of read results so offline reads have something
//! to serve and repeated reads skip the network. Entries expire after a
//! TTL (checked lazily on lookup) and the cache is bounded, evicting the
//! earliest-inserted entry past the bound. Deliberately not durable:
//! only the mutation queue needs to survive a restart, and stale read
//! data is cheap to rebuild.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys in first-insertion order. A key keeps its original position
    /// when overwritten, so eviction stays strictly oldest-first.
    insertion_order: VecDeque<String>,
}

pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Deterministic signature of a request: verb, path, and sorted query.
    pub fn key_for(verb: &str, resource: &str, query: &[(String, String)]) -> String {
        if query.is_empty() {
            return format!("{verb} {resource}");
        }
        let mut pairs: Vec<&(String, String)> = query.iter().collect();
        pairs.sort();
        let qs = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{verb} {resource}?{qs}")
    }

    /// Look up a cached value. Expired entries are deleted on access and
    /// reported as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().ok()?;
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            inner.insertion_order.retain(|k| k != key);
            debug!(key, "cache entry expired");
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Store a value under the given key, evicting the single oldest entry
    /// if the bound is exceeded.
    pub fn put(&self, key: &str, value: Value) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        ).is_none()
        {
            inner.insertion_order.push_back(key.to_string());
        }

        while inner.entries.len() > self.max_entries {
            match inner.insertion_order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                    debug!(key = %oldest, "cache bound reached, evicted oldest entry");
                }
                None => break,
            }
        }
    }

    /// Remove all entries whose resource path falls under the given
    /// family prefix. Keys look like `"GET /api/transactions?..."`, so the
    /// match skips the verb.
    pub fn invalidate_family(&self, family_prefix: &str) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let before = inner.entries.len();
        inner
            .entries
            .retain(|key, _| !key_matches_family(key, family_prefix));
        inner.insertion_order.retain(|key| !key_matches_family(key, family_prefix));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(family = family_prefix, removed, "cache family invalidated");
        }
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.insertion_order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn key_matches_family(key: &str, family_prefix: &str) -> bool {
    match key.split_once(' ') {
        Some((_verb, rest)) => rest.starts_with(family_prefix),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_signature_is_order_insensitive() {
        let a = ResponseCache::key_for(
            "GET",
            "/api/reports",
            &[("to".into(), "2026-02".into()), ("from".into(), "2026-01".into())],
        );
        let b = ResponseCache::key_for(
            "GET",
            "/api/reports",
            &[("from".into(), "2026-01".into()), ("to".into(), "2026-02".into())],
        );
        assert_eq!(a, b);
        assert_eq!(a, "GET /api/reports?from=2026-01&to=2026-02");
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let cache = ResponseCache::new(Duration::from_millis(20), 100);
        cache.put("GET /api/suppliers", json!([{ "id": 1, "name": "X" }]));
        assert!(cache.get("GET /api/suppliers").is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("GET /api/suppliers").is_none());
        // The expired entry was deleted on access, not just hidden.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_bound_evicts_earliest_inserted_first() {
        let cache = ResponseCache::new(Duration::from_secs(3600), 100);
        for i in 0..150 {
            cache.put(&format!("GET /api/transactions?page={i}"), json!(i));
        }
        assert_eq!(cache.len(), 100);
        // The 50 earliest keys are gone, the 100 newest remain.
        assert!(cache.get("GET /api/transactions?page=49").is_none());
        assert!(cache.get("GET /api/transactions?page=50").is_some());
        assert!(cache.get("GET /api/transactions?page=149").is_some());
    }

    #[test]
    fn test_overwrite_keeps_original_insertion_position() {
        let cache = ResponseCache::new(Duration::from_secs(3600), 2);
        cache.put("GET /api/bills", json!(1));
        cache.put("GET /api/suppliers", json!(2));
        cache.put("GET /api/bills", json!(3));
        // bills is still the oldest entry; inserting a third key evicts it.
        cache.put("GET /api/inventory", json!(4));
        assert!(cache.get("GET /api/bills").is_none());
        assert_eq!(cache.get("GET /api/suppliers"), Some(json!(2)));
        assert_eq!(cache.get("GET /api/inventory"), Some(json!(4)));
    }

    #[test]
    fn test_invalidate_family_spares_other_resources() {
        let cache = ResponseCache::new(Duration::from_secs(3600), 100);
        cache.put("GET /api/transactions", json!([1]));
        cache.put("GET /api/transactions?dateRange=week", json!([2]));
        cache.put("GET /api/suppliers", json!([3]));

        let removed = cache.invalidate_family("/api/transactions");
        assert_eq!(removed, 2);
        assert!(cache.get("GET /api/transactions").is_none());
        assert!(cache.get("GET /api/suppliers").is_some());
    }
}
