//! # OfflineKit Cache
//!
//! Versioned cache buckets for the OfflineKit offline-cache toolkit.
//!
//! A bucket is a named key-value store mapping a request identity
//! (method + URL) to a stored response snapshot. Exactly one bucket is
//! current per deployed version; every other bucket is stale and eligible
//! for deletion at the next activation.
//!
//! ## Architecture
//!
//! ```text
//! BucketStore (caches)
//!     └── CacheBucket ("app-shell-v2")
//!             └── RequestKey → CacheEntry
//! ```

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use url::Url;

use offlinekit_common::{OptionExt, Result};

// ==================== Request Identity ====================

/// Identity of a cached request: method plus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    /// Request method (uppercase).
    pub method: String,
    /// Full request URL.
    pub url: String,
}

impl RequestKey {
    /// Create a key from a method and URL.
    pub fn new(method: &str, url: &Url) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    /// Create a GET key, the common case for cached resources.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }
}

// ==================== Cache Entry ====================

/// A stored response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            cached_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Cache Bucket ====================

/// A named cache bucket.
#[derive(Debug, Default)]
pub struct CacheBucket {
    /// Bucket name (version string).
    pub name: String,

    /// Cached entries.
    entries: HashMap<RequestKey, CacheEntry>,
}

impl CacheBucket {
    /// Create a new bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request against the bucket.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous one for the same key.
    pub fn put(&mut self, key: RequestKey, entry: CacheEntry) {
        debug!(bucket = %self.name, url = %key.url, status = entry.status, "cache put");
        self.entries.insert(key, entry);
    }

    /// Store a batch of entries in one step. Used by install-time
    /// pre-caching so a bucket never holds a partial shell.
    pub fn put_all(&mut self, entries: Vec<(RequestKey, CacheEntry)>) {
        for (key, entry) in entries {
            self.put(key, entry);
        }
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Bucket Store ====================

/// The set of all cache buckets.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: HashMap<String, CacheBucket>,
}

impl BucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bucket, creating it if it does not exist.
    pub fn open(&mut self, name: &str) -> &mut CacheBucket {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| CacheBucket::new(name))
    }

    /// Check if a bucket exists.
    pub fn has(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// Get a bucket by name.
    pub fn bucket(&self, name: &str) -> Result<&CacheBucket> {
        self.buckets.get(name).ok_or_not_found(name)
    }

    /// Get a bucket by name, mutably.
    pub fn bucket_mut(&mut self, name: &str) -> Result<&mut CacheBucket> {
        self.buckets.get_mut(name).ok_or_not_found(name)
    }

    /// Delete a bucket.
    pub fn delete(&mut self, name: &str) -> bool {
        debug!(bucket = %name, "deleting cache bucket");
        self.buckets.remove(name).is_some()
    }

    /// All bucket names.
    pub fn names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    /// Delete every bucket except the named one. Returns the names of the
    /// buckets that were removed.
    pub fn purge_except(&mut self, current: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .buckets
            .keys()
            .filter(|name| name.as_str() != current)
            .cloned()
            .collect();
        for name in &stale {
            debug!(bucket = %name, "removing stale cache bucket");
            self.buckets.remove(name);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str) -> RequestKey {
        RequestKey::get(&Url::parse(url).unwrap())
    }

    fn entry(status: u16, body: &[u8]) -> CacheEntry {
        CacheEntry::new(status, HashMap::new(), body.to_vec())
    }

    #[test]
    fn test_request_key_normalizes_method() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let k = RequestKey::new("get", &url);
        assert_eq!(k, RequestKey::get(&url));
    }

    #[test]
    fn test_bucket_put_and_match() {
        let mut bucket = CacheBucket::new("v1");
        bucket.put(key("https://example.com/style.css"), entry(200, b"body{}"));

        assert!(bucket
            .match_request(&key("https://example.com/style.css"))
            .is_some());
        assert!(bucket
            .match_request(&key("https://example.com/other.css"))
            .is_none());
    }

    #[test]
    fn test_bucket_put_replaces() {
        let mut bucket = CacheBucket::new("v1");
        let k = key("https://example.com/app.js");
        bucket.put(k.clone(), entry(200, b"old"));
        bucket.put(k.clone(), entry(200, b"new"));

        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.match_request(&k).unwrap().body, b"new");
    }

    #[test]
    fn test_bucket_delete() {
        let mut bucket = CacheBucket::new("v1");
        let k = key("https://example.com/style.css");
        bucket.put(k.clone(), entry(200, b""));

        assert!(bucket.delete(&k));
        assert!(bucket.match_request(&k).is_none());
        assert!(!bucket.delete(&k));
    }

    #[test]
    fn test_bucket_put_all() {
        let mut bucket = CacheBucket::new("v1");
        bucket.put_all(vec![
            (key("https://example.com/"), entry(200, b"<html>")),
            (key("https://example.com/manifest.json"), entry(200, b"{}")),
        ]);
        assert_eq!(bucket.len(), 2);
        assert!(bucket
            .keys()
            .iter()
            .any(|k| k.url == "https://example.com/manifest.json"));
    }

    #[test]
    fn test_store_open_and_delete() {
        let mut store = BucketStore::new();

        assert!(!store.has("v1"));
        store.open("v1");
        assert!(store.has("v1"));

        assert!(store.delete("v1"));
        assert!(!store.has("v1"));
    }

    #[test]
    fn test_store_bucket_not_found() {
        let store = BucketStore::new();
        assert!(store.bucket("missing").is_err());
    }

    #[test]
    fn test_store_purge_except() {
        let mut store = BucketStore::new();
        store.open("v1");
        store.open("v2");
        store.open("v3");

        let mut purged = store.purge_except("v2");
        purged.sort();
        assert_eq!(purged, vec!["v1".to_string(), "v3".to_string()]);
        assert_eq!(store.names(), vec!["v2".to_string()]);
    }

    #[test]
    fn test_store_purge_except_keeps_missing_current() {
        // Purging against a name that was never opened clears everything
        // and creates nothing.
        let mut store = BucketStore::new();
        store.open("v1");

        store.purge_except("v2");
        assert!(store.names().is_empty());
        assert!(!store.has("v2"));
    }

    #[test]
    fn test_entry_serde() {
        let e = entry(200, b"abc");
        let json = serde_json::to_string(&e).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, 200);
        assert_eq!(back.body, b"abc");
    }
}
