//! Bounded cache of `resources/read` results.

use dashmap::DashMap;
use serde_json::Value;

use crate::observability::metrics;

/// Keyed by `(server_id, uri)`. Cleared wholesale once full.
#[derive(Debug)]
pub struct ResourceCache {
    entries: DashMap<(String, String), Value>,
    max_entries: usize,
}

impl ResourceCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, server_id: &str, uri: &str) -> Option<Value> {
        self.entries
            .get(&(server_id.to_string(), uri.to_string()))
            .map(|v| v.value().clone())
    }

    pub fn insert(&self, server_id: &str, uri: &str, contents: Value) {
        if self.entries.len() >= self.max_entries {
            tracing::debug!(entries = self.entries.len(), "Resource cache full, clearing");
            self.entries.clear();
        }
        self.entries.insert((server_id.to_string(), uri.to_string()), contents);
        metrics::record_cache_size(self.entries.len());
    }

    /// Drop every entry belonging to `server_id`.
    pub fn invalidate_server(&self, server_id: &str) {
        self.entries.retain(|(server, _), _| server != server_id);
        metrics::record_cache_size(self.entries.len());
    }

    pub fn clear(&self) {
        self.entries.clear();
        metrics::record_cache_size(0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clears_wholesale_when_full() {
        let cache = ResourceCache::new(2);
        cache.insert("fs", "file:///a", json!("a"));
        cache.insert("fs", "file:///b", json!("b"));
        assert_eq!(cache.len(), 2);

        cache.insert("fs", "file:///c", json!("c"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("fs", "file:///a").is_none());
        assert_eq!(cache.get("fs", "file:///c"), Some(json!("c")));
    }

    #[test]
    fn test_invalidate_server_keeps_others() {
        let cache = ResourceCache::new(10);
        cache.insert("fs", "file:///a", json!(1));
        cache.insert("db", "db://t", json!(2));
        cache.invalidate_server("fs");
        assert!(cache.get("fs", "file:///a").is_none());
        assert_eq!(cache.get("db", "db://t"), Some(json!(2)));
    }
}
