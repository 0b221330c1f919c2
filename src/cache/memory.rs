//! Hash map based in memory cache.
//!
//! For testing only, not for production use: it mirrors the store
//! contract (ttl no-op, glob invalidation, persistence re-check) without
//! leaving the process, and counts writes so tests can wait for the
//! detached store tasks.

use crate::cache::{Cache, CacheEntry};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `set` calls that stored an entry.
    pub fn saving_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `get` calls, hits and misses alike.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn insert(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().insert(key.to_string(), entry);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let entry = self.entries.lock().get(key).cloned()?;
        if !entry.cache_header.should_persist() {
            return None;
        }
        Some(entry)
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        if entry.cache_header.ttl().is_zero() {
            return;
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(key.to_string(), entry);
    }

    async fn invalidate(&self, pattern: &str) -> Result<()> {
        let pattern = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
        let matcher = Regex::new(&pattern)
            .map_err(|e| ProxyError::Store(format!("invalid pattern: {e}")))?;
        self.entries.lock().retain(|key, _| !matcher.is_match(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheControl;
    use std::time::SystemTime;

    fn entry(cc: &str) -> CacheEntry {
        CacheEntry {
            saved_at: SystemTime::now(),
            cache_header: CacheControl::parse(cc),
            headers: vec![],
            body: b"B".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_set_is_noop_without_ttl() {
        let cache = MemoryCache::new();
        cache.set("/k|1", entry("public")).await;
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.saving_count(), 0);

        cache.set("/k|1", entry("public, s-maxage=60")).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.saving_count(), 1);
        assert!(cache.get("/k|1").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_glob() {
        let cache = MemoryCache::new();
        cache.set("/a|111", entry("public, s-maxage=60")).await;
        cache.set("/a|222", entry("public, s-maxage=60")).await;
        cache.set("/b|333", entry("public, s-maxage=60")).await;

        cache.invalidate("/a|*").await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("/b|333").await.is_some());

        cache.invalidate("*").await.unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_unpersistable_stored_entry_is_a_miss() {
        let cache = MemoryCache::new();
        // bypass set() to simulate an entry stored under an older policy
        cache.insert("/k|1", entry("public"));
        assert!(cache.get("/k|1").await.is_none());
    }
}
