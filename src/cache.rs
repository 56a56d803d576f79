//! External Cache Adapter (C10): an optional read-through cache in front of
//! directory capability statements and other small, slow-changing metadata.
//! Never used for history/search pages themselves (those carry the watermark).

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

use crate::config::CacheConfig;

struct Entry {
    loaded_at: Instant,
    value: Value,
}

/// In-process, namespaced, TTL-bounded cache (spec §4.10). `host`/`port`/`ssl`
/// are carried on `CacheConfig` for a future networked backend but this
/// adapter only ever runs in-process — see DESIGN.md.
pub struct MetadataCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    namespace: String,
    enabled: bool,
}

impl MetadataCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.object_ttl),
            namespace: config.default_cache_namespace.clone(),
            enabled: config.enabled,
        }
    }

    fn key(&self, namespace: Option<&str>, key: &str) -> String {
        format!("{}:{}", namespace.unwrap_or(&self.namespace), key)
    }

    pub fn get(&self, namespace: Option<&str>, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let full_key = self.key(namespace, key);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(&full_key)?;
        if entry.loaded_at.elapsed() >= self.ttl {
            entries.pop(&full_key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, namespace: Option<&str>, key: &str, value: Value) {
        if !self.enabled {
            return;
        }
        let full_key = self.key(namespace, key);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.put(
            full_key,
            Entry {
                loaded_at: Instant::now(),
                value,
            },
        );
    }

    pub fn invalidate(&self, namespace: Option<&str>, key: &str) {
        let full_key = self.key(namespace, key);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.pop(&full_key);
    }

    /// Fetches through the cache, calling `load` only on a miss or expiry.
    pub async fn get_or_load<F, Fut>(
        &self,
        namespace: Option<&str>,
        key: &str,
        load: F,
    ) -> crate::Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::Result<Value>>,
    {
        if let Some(cached) = self.get(namespace, key) {
            return Ok(cached);
        }
        let value = load().await?;
        self.put(namespace, key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ttl_secs: u64) -> CacheConfig {
        CacheConfig {
            enabled: true,
            host: "localhost".into(),
            port: 6379,
            ssl: false,
            object_ttl: ttl_secs,
            default_cache_namespace: "mcsd".into(),
            max_entries: 16,
        }
    }

    #[test]
    fn disabled_cache_never_stores() {
        let mut cfg = config(60);
        cfg.enabled = false;
        let cache = MetadataCache::new(&cfg);
        cache.put(None, "k", serde_json::json!({"a": 1}));
        assert!(cache.get(None, "k").is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = MetadataCache::new(&config(60));
        cache.put(None, "capability", serde_json::json!({"resourceType": "CapabilityStatement"}));
        let got = cache.get(None, "capability").unwrap();
        assert_eq!(got["resourceType"], "CapabilityStatement");
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = MetadataCache::new(&config(0));
        cache.put(None, "k", serde_json::json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(None, "k").is_none());
    }

    #[test]
    fn namespaces_are_isolated() {
        let cache = MetadataCache::new(&config(60));
        cache.put(Some("a"), "k", serde_json::json!(1));
        cache.put(Some("b"), "k", serde_json::json!(2));
        assert_eq!(cache.get(Some("a"), "k").unwrap(), serde_json::json!(1));
        assert_eq!(cache.get(Some("b"), "k").unwrap(), serde_json::json!(2));
    }
}
