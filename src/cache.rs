//! Extraction result cache
//!
//! Successful high-confidence extractions are stored under a key derived from
//! the normalized document text, the document type and the complexity
//! bucket, so re-scans of the same document skip the model tiers.
//!
//! # Thread Safety
//!
//! [`MemoryCacheStore`] keeps its LRU behind a `parking_lot::Mutex`; the
//! access counter of an entry is updated while the lock is held.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fields::{DocumentType, StructuredFields};
use crate::routing::ComplexityBucket;
use crate::text::normalize_for_cache;

/// Default time-to-live of cache entries (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of entries kept in memory
pub const DEFAULT_CAPACITY: usize = 1000;

/// Cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry could not be encoded: {0}")]
    Serialization(String),
}

/// Cached extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub normalized_text_hash: String,
    pub extracted_fields: StructuredFields,
    pub model_used: String,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
}

/// Key/value store for extraction results
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Cache key: SHA-256 over normalized text, document type and complexity bucket
pub fn cache_key(text: &str, document_type: DocumentType, bucket: ComplexityBucket) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_cache(text).as_bytes());
    hasher.update(b"|");
    hasher.update(document_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// In-memory Store
// ============================================================================

#[derive(Debug)]
struct StoredEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory LRU store with per-entry expiry
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: Mutex<LruCache<String, StoredEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryCacheStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, stored)| stored.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Cleaned up expired cache entries");
        }
        expired.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(stored) if stored.expires_at > Instant::now() => {
                stored.entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(stored.entry.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let stored = StoredEntry {
            entry,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(model: &str) -> CacheEntry {
        CacheEntry {
            normalized_text_hash: "abc".to_string(),
            extracted_fields: StructuredFields {
                invoice_number: Some("2024001".to_string()),
                ..Default::default()
            },
            model_used: model.to_string(),
            confidence_score: 0.9,
            created_at: Utc::now(),
            access_count: 0,
        }
    }

    #[test]
    fn test_cache_key_is_stable_under_noise() {
        let a = cache_key(
            "Faktura 2024001\nCelkem   1 815,00 Kč\nDatum 12.03.2024",
            DocumentType::Invoice,
            ComplexityBucket::Simple,
        );
        let b = cache_key(
            "FAKTURA 2024002 celkem 1 900,00 Kč datum 13.03.2024",
            DocumentType::Invoice,
            ComplexityBucket::Simple,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_separates_type_and_bucket() {
        let text = "Faktura 2024001 celkem 1815";
        let invoice = cache_key(text, DocumentType::Invoice, ComplexityBucket::Simple);
        assert_ne!(invoice, cache_key(text, DocumentType::Receipt, ComplexityBucket::Simple));
        assert_ne!(invoice, cache_key(text, DocumentType::Invoice, ComplexityBucket::Complex));
    }

    #[tokio::test]
    async fn test_put_get_counts_access() {
        let store = MemoryCacheStore::default();
        store.put("k", entry("premium"), DEFAULT_TTL).await.unwrap();

        let first = store.get("k").await.unwrap().unwrap();
        let second = store.get("k").await.unwrap().unwrap();
        assert_eq!(first.access_count, 1);
        assert_eq!(second.access_count, 2);
        assert_eq!(second.model_used, "premium");

        assert!(store.get("missing").await.unwrap().is_none());
        let stats = store.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let store = MemoryCacheStore::default();
        store.put("k", entry("budget"), Duration::ZERO).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = MemoryCacheStore::default();
        store.put("old", entry("a"), Duration::ZERO).await.unwrap();
        store.put("fresh", entry("b"), DEFAULT_TTL).await.unwrap();

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.stats().entries, 1);
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_and_delete() {
        let store = MemoryCacheStore::new(2);
        store.put("a", entry("a"), DEFAULT_TTL).await.unwrap();
        store.put("b", entry("b"), DEFAULT_TTL).await.unwrap();
        store.put("c", entry("c"), DEFAULT_TTL).await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());

        store.delete("b").await.unwrap();
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }
}
