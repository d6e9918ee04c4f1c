//! In-memory front cache for resolved tiles.
//!
//! Sits in front of the disk cache so hot tiles (the ones every composite
//! around a popular area needs) skip the filesystem. Bounded by total bytes
//! with LRU eviction. Each entry carries the instant its source went stale
//! (file mtime or fetch time plus the layer TTL) and is dropped once that
//! passes, so memory never outlives what the disk cache would serve as fresh.

use std::num::NonZeroUsize;
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::grid::TileAddress;

/// Default capacity: 64MB
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Upper bound on entries, to bound LRU bookkeeping for tiny tiles.
const DEFAULT_MAX_ENTRIES: usize = 16_384;

/// Identifies one tile of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    pub layer_id: String,
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
}

impl From<&TileAddress> for TileCacheKey {
    fn from(address: &TileAddress) -> Self {
        Self {
            layer_id: address.layer_id.clone(),
            zoom: address.zoom,
            column: address.column,
            row: address.row,
        }
    }
}

struct Entry {
    data: Bytes,
    expires: Option<SystemTime>,
}

struct Inner {
    entries: LruCache<TileCacheKey, Entry>,
    size: usize,
}

impl Inner {
    fn pop(&mut self, key: &TileCacheKey) -> Option<Entry> {
        let entry = self.entries.pop(key)?;
        self.size = self.size.saturating_sub(entry.data.len());
        Some(entry)
    }
}

/// Byte-bounded LRU of tile bytes. A capacity of 0 disables caching.
pub struct TileCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl TileCache {
    /// Create a cache holding at most `max_size` bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache bounded by bytes and by entry count.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(max_entries),
                size: 0,
            }),
            max_size,
        }
    }

    /// Look up a tile, dropping it once its expiry has passed.
    pub async fn get(&self, key: &TileCacheKey) -> Option<Bytes> {
        if self.max_size == 0 {
            return None;
        }
        let now = SystemTime::now();
        let mut inner = self.inner.lock().await;
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires.is_some_and(|expires| expires <= now),
        };
        if expired {
            inner.pop(key);
            return None;
        }
        inner.entries.peek(key).map(|entry| entry.data.clone())
    }

    /// Insert or replace a tile valid until `expires` (`None` never
    /// expires), then evict least-recently-used entries until the cache fits.
    pub async fn put(&self, key: TileCacheKey, data: Bytes, expires: Option<SystemTime>) {
        if self.max_size == 0 || data.len() > self.max_size {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.pop(&key);
        if expires.is_some_and(|expires| expires <= SystemTime::now()) {
            return;
        }
        inner.size += data.len();
        let entry = Entry { data, expires };
        if let Some((_, evicted)) = inner.entries.push(key, entry) {
            inner.size = inner.size.saturating_sub(evicted.data.len());
        }
        while inner.size > self.max_size {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.size = inner.size.saturating_sub(evicted.data.len()),
                None => break,
            }
        }
    }

    /// Remove a tile, returning its bytes if it was cached.
    pub async fn remove(&self, key: &TileCacheKey) -> Option<Bytes> {
        let mut inner = self.inner.lock().await;
        inner.pop(key).map(|entry| entry.data)
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.size = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Total bytes currently cached.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.size
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================
