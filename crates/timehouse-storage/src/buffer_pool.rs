//! Buffer Pool with LRU Eviction
//!
//! All reads of segment files - meta and data alike - go through one shared
//! pool sitting on top of the object store.
//!
//! ## Why a pool?
//!
//! Object stores have high per-request latency. Without caching every query
//! would re-fetch the same meta files and the same hot data pages; with it,
//! repeated scans of a table cost one round trip per file until eviction.
//!
//! ```text
//! cursor asks for tables/orders/data/log-l00-....arrow
//!         │
//!         ▼
//!     in cache? ──yes──► Bytes (refcounted, zero copy)
//!         │no
//!         ▼
//!   object store GET ──► insert ──► evict LRU until under capacity
//! ```
//!
//! ## Pinning
//!
//! A cursor pins the files it is actively merging; pinned entries are exempt
//! from eviction so a long scan cannot have its own pages evicted under it by
//! a concurrent compaction filling the pool. Dropping the cursor unpins.
//!
//! ## Counters
//!
//! The pool counts hits, misses, fetches and decoded data pages. The
//! pushdown tests observe the page counter: a scan whose predicate is ruled
//! out by segment metadata must decode zero data pages.

use bytes::Bytes;
use futures::TryStreamExt;
use lru::LruCache;
use object_store::path::Path;
use object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::layout::{meta_prefix, parse_segment_filename, SegmentId};

/// Shared byte cache over the object store.
pub struct BufferPool {
    store: Arc<dyn ObjectStore>,
    capacity_bytes: u64,
    state: Mutex<PoolState>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    data_pages_decoded: AtomicU64,
}

struct PoolState {
    lru: LruCache<String, Bytes>,
    size: u64,
    pins: HashMap<String, usize>,
}

/// A point-in-time view of the pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub data_pages_decoded: u64,
    pub cached_bytes: u64,
    pub cached_entries: usize,
}

impl BufferPool {
    pub fn new(store: Arc<dyn ObjectStore>, capacity_bytes: u64) -> Self {
        BufferPool {
            store,
            capacity_bytes,
            state: Mutex::new(PoolState {
                lru: LruCache::unbounded(),
                size: 0,
                pins: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            data_pages_decoded: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("buffer pool lock poisoned")
    }

    /// Read a whole object, from cache when possible.
    pub async fn get(&self, path: &str) -> Result<Bytes> {
        {
            let mut state = self.lock_state();
            if let Some(bytes) = state.lru.get(path) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(bytes.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // No lock held across the fetch. Two cursors racing on the same cold
        // object both fetch; the second insert is a harmless overwrite.
        let bytes = self.fetch_with_retry(path).await?;
        tracing::debug!(path = %path, size = bytes.len(), "buffer pool fetch");

        let mut state = self.lock_state();
        state.insert(path.to_string(), bytes.clone());
        state.evict_to(self.capacity_bytes);
        Ok(bytes)
    }

    /// Object reads are idempotent, so transient store failures retry here
    /// instead of failing the cursor. A missing object fails immediately.
    async fn fetch_with_retry(&self, path: &str) -> Result<Bytes> {
        const ATTEMPTS: u32 = 3;
        let location = Path::from(path);
        let mut last_err = None;
        for attempt in 1..=ATTEMPTS {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            match self.store.get(&location).await {
                Ok(result) => return Ok(result.bytes().await?),
                // a missing object will not appear on retry
                Err(e @ object_store::Error::NotFound { .. }) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(path = %path, attempt, error = %e, "segment fetch failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(10 << attempt)).await;
                }
            }
        }
        Err(last_err.expect("at least one attempt ran").into())
    }

    /// Write-through publish: put to the object store and warm the cache.
    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<()> {
        self.store.put(&Path::from(path), bytes.clone().into()).await?;
        let mut state = self.lock_state();
        state.insert(path.to_string(), bytes);
        state.evict_to(self.capacity_bytes);
        Ok(())
    }

    /// Remove an object from the store and the cache.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(&Path::from(path)).await?;
        let mut state = self.lock_state();
        if let Some(bytes) = state.lru.pop(path) {
            state.size -= bytes.len() as u64;
        }
        Ok(())
    }

    /// Exempt an object from eviction while a cursor reads it. The short
    /// critical section is why this is a sync lock: cursors unpin on drop.
    pub fn pin(&self, path: &str) {
        let mut state = self.lock_state();
        *state.pins.entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn unpin(&self, path: &str) {
        let mut state = self.lock_state();
        if let Some(count) = state.pins.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(path);
            }
        }
    }

    /// List the segment ids published for a table, from its meta files.
    pub async fn list_segments(&self, table: &str) -> Result<Vec<SegmentId>> {
        let prefix = Path::from(meta_prefix(table));
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut ids = Vec::with_capacity(objects.len());
        for object in objects {
            match object.location.filename() {
                Some(name) => match parse_segment_filename(name) {
                    Ok(id) => ids.push(id),
                    Err(e) => {
                        tracing::warn!(path = %object.location, error = %e, "skipping unparseable segment file");
                    }
                },
                None => continue,
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Count one decoded data page (called by the segment reader).
    pub fn record_page_decode(&self) {
        self.data_pages_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            data_pages_decoded: self.data_pages_decoded.load(Ordering::Relaxed),
            cached_bytes: state.size,
            cached_entries: state.lru.len(),
        }
    }
}

impl PoolState {
    fn insert(&mut self, path: String, bytes: Bytes) {
        if let Some(old) = self.lru.put(path, bytes.clone()) {
            self.size -= old.len() as u64;
        }
        self.size += bytes.len() as u64;
    }

    fn evict_to(&mut self, capacity: u64) {
        let mut pinned_stash = Vec::new();
        while self.size > capacity {
            match self.lru.pop_lru() {
                Some((path, bytes)) => {
                    if self.pins.contains_key(&path) {
                        // Exempt; set aside and keep looking. If everything
                        // is pinned the loop drains the LRU and stops.
                        pinned_stash.push((path, bytes));
                        continue;
                    }
                    tracing::debug!(path = %path, size = bytes.len(), "buffer pool evict");
                    self.size -= bytes.len() as u64;
                }
                None => break,
            }
        }
        for (path, bytes) in pinned_stash {
            self.lru.put(path, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    async fn pool_with(capacity: u64, objects: &[(&str, usize)]) -> BufferPool {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        for (path, size) in objects {
            store
                .put(&Path::from(*path), Bytes::from(vec![7u8; *size]).into())
                .await
                .unwrap();
        }
        BufferPool::new(store, capacity)
    }

    #[tokio::test]
    async fn test_get_caches() {
        let pool = pool_with(1024, &[("a", 10)]).await;
        let first = pool.get("a").await.unwrap();
        let second = pool.get("a").await.unwrap();
        assert_eq!(first, second);
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.fetches, 1);
    }

    #[tokio::test]
    async fn test_missing_object_errors() {
        let pool = pool_with(1024, &[]).await;
        assert!(pool.get("absent").await.is_err());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let pool = pool_with(250, &[("a", 100), ("b", 100), ("c", 100)]).await;
        pool.get("a").await.unwrap();
        pool.get("b").await.unwrap();
        pool.get("c").await.unwrap(); // evicts a
        let stats = pool.stats();
        assert_eq!(stats.cached_entries, 2);
        assert!(stats.cached_bytes <= 250);

        // a is refetched, not served from cache
        pool.get("a").await.unwrap();
        assert_eq!(pool.stats().fetches, 4);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_eviction() {
        let pool = pool_with(250, &[("a", 100), ("b", 100), ("c", 100)]).await;
        pool.get("a").await.unwrap();
        pool.pin("a");
        pool.get("b").await.unwrap();
        pool.get("c").await.unwrap();

        // a was LRU but pinned; it must still be a cache hit
        let hits_before = pool.stats().hits;
        pool.get("a").await.unwrap();
        assert_eq!(pool.stats().hits, hits_before + 1);

        pool.unpin("a");
    }

    #[tokio::test]
    async fn test_put_is_write_through() {
        let pool = pool_with(1024, &[]).await;
        pool.put("x", Bytes::from_static(b"hello")).await.unwrap();
        // served from cache: no fetch
        pool.get("x").await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.fetches, 0);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let pool = pool_with(1024, &[("x", 5)]).await;
        pool.get("x").await.unwrap();
        pool.delete("x").await.unwrap();
        assert!(pool.get("x").await.is_err());
        assert_eq!(pool.stats().cached_bytes, 0);
    }

    #[tokio::test]
    async fn test_list_segments_parses_and_skips() {
        let pool = pool_with(
            1024,
            &[
                ("tables/orders/meta/log-l00-fr0000000000000000-nr0000000000000100.arrow", 4),
                ("tables/orders/meta/not-a-segment.txt", 4),
                ("tables/other/meta/log-l00-fr0000000000000000-nr0000000000000001.arrow", 4),
            ],
        )
        .await;
        let ids = pool.list_segments("orders").await.unwrap();
        assert_eq!(
            ids,
            vec![SegmentId {
                level: 0,
                first_row: 0,
                next_row: 0x100
            }]
        );
    }
}
