//! Upstream response cache
//!
//! Caches raw results of idempotent Qtum RPC methods keyed by
//! `(method, canonical params)`. Only whitelisted methods are stored;
//! tip-sensitive queries never appear in the whitelist.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Hard cap on resident entries; oldest evicted first.
const MAX_ENTRIES: usize = 4096;

/// Upstream methods whose responses may be served from cache.
///
/// Everything here is keyed by an immutable identifier (hash, explicit
/// height, txid). `getblockcount`, wallet queries and fee estimation are
/// deliberately absent.
const CACHEABLE_METHODS: &[&str] = &[
    "getblock",
    "getblockhash",
    "getblockheader",
    "getrawtransaction",
    "gettransactionreceipt",
];

#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// TTL response cache guarded by a read-write lock: parallel reads,
/// exclusive writes.
pub struct ResponseCache {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `method` may be served from / stored into the cache.
    pub fn is_cacheable(&self, method: &str) -> bool {
        CACHEABLE_METHODS.contains(&method)
    }

    /// Canonical cache key for a params value.
    fn canonical(params: &JsonValue) -> String {
        params.to_string()
    }

    /// Look up a cached result. Expired entries are dropped on sight.
    pub fn get(&self, method: &str, params: &JsonValue) -> Option<JsonValue> {
        let key = (method.to_string(), Self::canonical(params));

        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(&key) {
                Some(entry) if !entry.is_expired() => {
                    debug!(method, "upstream cache hit");
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: take the write lock to remove it.
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.remove(&key);
        None
    }

    /// Store a successful result for a whitelisted method.
    pub fn store(&self, method: &str, params: &JsonValue, value: JsonValue) {
        if !self.is_cacheable(method) {
            return;
        }

        let mut entries = self.entries.write().expect("cache lock poisoned");

        if entries.len() >= MAX_ENTRIES {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
                debug!("evicted oldest upstream cache entry");
            }
        }

        entries.insert(
            (method.to_string(), Self::canonical(params)),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl: DEFAULT_TTL,
            },
        );
    }

    /// Number of resident entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whitelist_gates_storage() {
        let cache = ResponseCache::new();
        cache.store("getblockcount", &json!([]), json!(813));
        assert!(cache.get("getblockcount", &json!([])).is_none());
        assert!(cache.is_empty());

        cache.store("getblockhash", &json!([5]), json!("aa"));
        assert_eq!(cache.get("getblockhash", &json!([5])), Some(json!("aa")));
    }

    #[test]
    fn keys_include_params() {
        let cache = ResponseCache::new();
        cache.store("getblockhash", &json!([1]), json!("one"));
        cache.store("getblockhash", &json!([2]), json!("two"));
        assert_eq!(cache.get("getblockhash", &json!([1])), Some(json!("one")));
        assert_eq!(cache.get("getblockhash", &json!([2])), Some(json!("two")));
        assert!(cache.get("getblockhash", &json!([3])).is_none());
    }

    #[test]
    fn eviction_caps_size() {
        let cache = ResponseCache::new();
        for i in 0..(MAX_ENTRIES + 10) {
            cache.store("getblockhash", &json!([i]), json!(i));
        }
        assert!(cache.len() <= MAX_ENTRIES);
    }
}
