//! Byte-budgeted image cache.
//!
//! Entries are kept in least-recently-accessed order. Every insertion is
//! followed by an eviction pass that pops the least recently accessed entry
//! until the total size is back under the budget, so
//! `used_bytes <= capacity_bytes` holds whenever `put` returns.
//!
//! Payload bytes are reference counted: `get` hands out a clone of the entry,
//! and evicting the entry afterwards never invalidates that clone.

use std::time::Instant;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::dicom::ImagePayload;

/// Default cache capacity: 512MB
pub const DEFAULT_CACHE_CAPACITY: usize = 512 * 1024 * 1024;

// =============================================================================
// Entries and statistics
// =============================================================================

/// A cached image.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub identifier: String,
    pub payload: ImagePayload,
    pub size_bytes: usize,
    pub last_accessed_at: Instant,
    pub loaded_at: Instant,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub entry_count: usize,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    used_bytes: usize,
    capacity_bytes: usize,
}

impl CacheState {
    /// Pop least recently accessed entries until `used_bytes <= limit`.
    fn evict_to(&mut self, limit: usize) -> usize {
        let mut evicted = 0;
        while self.used_bytes > limit {
            match self.entries.pop_lru() {
                Some((id, entry)) => {
                    self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
                    evicted += 1;
                    debug!(identifier = %id, size = entry.size_bytes, "Evicted cache entry");
                }
                None => break,
            }
        }
        evicted
    }
}

// =============================================================================
// ImageCache
// =============================================================================

/// LRU cache of image payloads with a byte budget.
///
/// # Thread Safety
///
/// All mutations (insert, evict, clear, resize) are serialized through a
/// write lock. `contains`, `stats` and `len` take the read lock and may run
/// concurrently with each other. `get` updates recency and therefore takes
/// the write lock.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use dicom_loader::cache::ImageCache;
/// use dicom_loader::dicom::ImagePayload;
///
/// #[tokio::main]
/// async fn main() {
///     let cache = ImageCache::with_capacity(10 * 1024 * 1024);
///
///     let payload = ImagePayload::new("wadors:1/2/3", Bytes::from(vec![0u8; 1024]), "application/dicom");
///     cache.put("wadors:1/2/3", payload).await;
///
///     let entry = cache.get("wadors:1/2/3").await.unwrap();
///     assert_eq!(entry.size_bytes, 1024);
/// }
/// ```
pub struct ImageCache {
    state: RwLock<CacheState>,
}

impl ImageCache {
    /// Create a cache with the default capacity (512MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a cache holding at most `capacity_bytes` of payload data.
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                capacity_bytes,
            }),
        }
    }

    /// Get an entry, marking it as the most recently accessed.
    pub async fn get(&self, id: &str) -> Option<CacheEntry> {
        let mut state = self.state.write().await;
        let entry = state.entries.get_mut(id)?;
        entry.last_accessed_at = Instant::now();
        Some(entry.clone())
    }

    /// Check for an entry without touching recency.
    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.entries.contains(id)
    }

    /// Insert or replace an entry, then evict down to the budget.
    ///
    /// An entry larger than the whole budget is evicted immediately after
    /// everything older has gone.
    pub async fn put(&self, id: impl Into<String>, payload: ImagePayload) {
        let id = id.into();
        let size_bytes = payload.size_bytes();
        let now = Instant::now();

        let mut state = self.state.write().await;

        if let Some(old) = state.entries.pop(&id) {
            state.used_bytes = state.used_bytes.saturating_sub(old.size_bytes);
        }

        state.entries.put(
            id.clone(),
            CacheEntry {
                identifier: id.clone(),
                payload,
                size_bytes,
                last_accessed_at: now,
                loaded_at: now,
            },
        );
        state.used_bytes += size_bytes;

        let limit = state.capacity_bytes;
        if state.used_bytes > limit {
            let evicted = state.evict_to(limit);
            debug!(
                identifier = %id,
                evicted,
                used = state.used_bytes,
                capacity = limit,
                "Cache over budget after insert"
            );
        }
    }

    /// Evict least recently accessed entries until at most `max_bytes` remain.
    ///
    /// Returns the number of evicted entries.
    pub async fn evict_to_limit(&self, max_bytes: usize) -> usize {
        self.state.write().await.evict_to(max_bytes)
    }

    /// Change the byte budget. Shrinking evicts immediately.
    pub async fn set_capacity(&self, capacity_bytes: usize) -> usize {
        let mut state = self.state.write().await;
        state.capacity_bytes = capacity_bytes;
        state.evict_to(capacity_bytes)
    }

    /// Remove an entry, returning it if it existed.
    pub async fn remove(&self, id: &str) -> Option<CacheEntry> {
        let mut state = self.state.write().await;
        let entry = state.entries.pop(id)?;
        state.used_bytes = state.used_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Remove every entry.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.used_bytes = 0;
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            used_bytes: state.used_bytes,
            capacity_bytes: state.capacity_bytes,
            entry_count: state.entries.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
