//! # Shared Page Cache
//!
//! One cache instance is shared by every store in the process. Entries are
//! keyed by `(partition, page id)`, where the partition is the store's path,
//! so stores never see each other's pages.
//!
//! ## Policies
//!
//! | Policy           | Structure                         | Eviction                       |
//! |------------------|-----------------------------------|--------------------------------|
//! | `Lru`            | slab doubly-linked list + index   | batch from the tail, 95% -> 80% |
//! | `CircularBuffer` | fixed ring + index                | overwrite the next ring slot   |
//!
//! ## Eviction Hooks
//!
//! A store subscribes an [`EvictionHandler`] for its partition. Before a page
//! is dropped the handler may flush it or retain it:
//!
//! ```text
//! cache                          store (handler)
//!   |-- before_evict(page_id) ------>|  flush modified page / check writer
//!   |<------------- Evict | Retain --|
//!   |   (remove entry)               |
//!   |-- after_evict(page_id) ------->|
//! ```
//!
//! Handlers are always invoked with the cache lock released, so a handler may
//! call back into the cache. Handlers are held as `Weak` references; a store
//! that was dropped without unsubscribing simply stops receiving callbacks.
//!
//! ## Capacity
//!
//! Capacity is counted in pages: `megabytes * 1 MiB / page_size`, at least
//! one. The bound is approximate: vetoed pages stay resident.

mod circular;
mod lru;

pub use circular::CircularBufferCache;
pub use lru::LruPageCache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::{DEFAULT_CACHE_MEGABYTES, DEFAULT_PAGE_SIZE};
use crate::page::{AppendOnlyFilePage, BinaryFilePage};
use crate::PageId;

/// Cache partition name. Stores use their file path.
pub type Partition = Arc<str>;

#[derive(Debug, Clone)]
pub enum CachedPage {
    AppendOnly(Arc<AppendOnlyFilePage>),
    Binary(Arc<BinaryFilePage>),
}

impl CachedPage {
    pub fn id(&self) -> PageId {
        match self {
            CachedPage::AppendOnly(p) => crate::page::Page::id(p.as_ref()),
            CachedPage::Binary(p) => p.id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionDecision {
    Evict,
    Retain,
}

pub trait EvictionHandler: Send + Sync {
    fn before_evict(&self, page_id: PageId) -> EvictionDecision;

    fn after_evict(&self, _page_id: PageId) {}
}

pub trait PageCache: Send + Sync {
    /// Inserts `page`, replacing any entry with the same id in `partition`.
    fn insert_or_update(&self, partition: &Partition, page: CachedPage);

    fn lookup(&self, partition: &Partition, page_id: PageId) -> Option<CachedPage>;

    /// Drops every entry of `partition` without consulting handlers.
    fn clear(&self, partition: &Partition);

    fn subscribe(&self, partition: &Partition, handler: Weak<dyn EvictionHandler>);

    fn unsubscribe(&self, partition: &Partition);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn stats(&self) -> CacheStats;
}

pub type SharedPageCache = Arc<dyn PageCache>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub vetoed: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    vetoed: AtomicU64,
}

impl StatCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn veto(&self) {
        self.vetoed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            vetoed: self.vetoed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub(crate) partition: Partition,
    pub(crate) page_id: PageId,
}

impl CacheKey {
    pub(crate) fn new(partition: &Partition, page_id: PageId) -> Self {
        Self {
            partition: partition.clone(),
            page_id,
        }
    }
}

/// Per-partition eviction subscribers.
#[derive(Default)]
pub(crate) struct EvictionHandlers {
    handlers: RwLock<HashMap<Partition, Weak<dyn EvictionHandler>>>,
}

impl EvictionHandlers {
    pub(crate) fn subscribe(&self, partition: &Partition, handler: Weak<dyn EvictionHandler>) {
        self.handlers.write().insert(partition.clone(), handler);
    }

    pub(crate) fn unsubscribe(&self, partition: &Partition) {
        self.handlers.write().remove(partition);
    }

    fn get(&self, partition: &Partition) -> Option<Arc<dyn EvictionHandler>> {
        self.handlers.read().get(partition).and_then(Weak::upgrade)
    }

    pub(crate) fn before_evict(&self, key: &CacheKey) -> EvictionDecision {
        match self.get(&key.partition) {
            Some(handler) => handler.before_evict(key.page_id),
            None => EvictionDecision::Evict,
        }
    }

    pub(crate) fn after_evict(&self, key: &CacheKey) {
        if let Some(handler) = self.get(&key.partition) {
            handler.after_evict(key.page_id);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    Lru,
    CircularBuffer,
}

/// Sizing and policy for the shared page cache.
#[derive(Debug, Clone, Copy)]
pub struct PageCacheConfig {
    pub megabytes: usize,
    pub page_size: usize,
    pub policy: CachePolicy,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            megabytes: DEFAULT_CACHE_MEGABYTES,
            page_size: DEFAULT_PAGE_SIZE,
            policy: CachePolicy::Lru,
        }
    }
}

impl PageCacheConfig {
    pub fn new(megabytes: usize, page_size: usize, policy: CachePolicy) -> Self {
        Self {
            megabytes,
            page_size,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        (self.megabytes * 1024 * 1024)
            .checked_div(self.page_size)
            .unwrap_or(0)
            .max(1)
    }

    pub fn build(&self) -> SharedPageCache {
        let capacity = self.capacity();
        tracing::debug!(capacity, policy = ?self.policy, "creating page cache");
        match self.policy {
            CachePolicy::Lru => Arc::new(LruPageCache::new(capacity)),
            CachePolicy::CircularBuffer => Arc::new(CircularBufferCache::new(capacity)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    pub(crate) fn page(id: PageId) -> CachedPage {
        CachedPage::AppendOnly(Arc::new(AppendOnlyFilePage::new(id, 64)))
    }

    /// Records callbacks and retains a configurable set of pages.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub(crate) retain: Mutex<HashSet<PageId>>,
        pub(crate) asked: Mutex<Vec<PageId>>,
        pub(crate) evicted: Mutex<Vec<PageId>>,
    }

    impl EvictionHandler for RecordingHandler {
        fn before_evict(&self, page_id: PageId) -> EvictionDecision {
            self.asked.lock().push(page_id);
            if self.retain.lock().contains(&page_id) {
                EvictionDecision::Retain
            } else {
                EvictionDecision::Evict
            }
        }

        fn after_evict(&self, page_id: PageId) {
            self.evicted.lock().push(page_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_megabytes_over_page_size() {
        let config = PageCacheConfig::new(4, 4096, CachePolicy::Lru);
        assert_eq!(config.capacity(), 1024);

        let tiny = PageCacheConfig::new(0, 4096, CachePolicy::CircularBuffer);
        assert_eq!(tiny.capacity(), 1);
    }

    #[test]
    fn build_selects_policy() {
        let lru = PageCacheConfig::new(1, 4096, CachePolicy::Lru).build();
        let ring = PageCacheConfig::new(1, 4096, CachePolicy::CircularBuffer).build();
        assert_eq!(lru.capacity(), 256);
        assert_eq!(ring.capacity(), 256);
        assert!(lru.is_empty());
    }

    #[test]
    fn dead_handler_allows_eviction() {
        let handlers = EvictionHandlers::default();
        let partition: Partition = Arc::from("p");
        {
            let handler: Arc<dyn EvictionHandler> =
                Arc::new(test_support::RecordingHandler::default());
            handlers.subscribe(&partition, Arc::downgrade(&handler));
        }
        let key = CacheKey::new(&partition, 1);
        assert_eq!(handlers.before_evict(&key), EvictionDecision::Evict);
    }

    #[test]
    fn hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
