//! LRU page cache.
//!
//! Entries live in a slab of nodes linked into a recency list (head is most
//! recent). A `hashbrown` index maps keys to slab slots. When an insert
//! brings the cache to its high-water mark (95% of capacity), an eviction
//! pass walks the list from the tail, consulting each partition's handler,
//! until the cache is down to the low-water mark (80%).
//!
//! A pass that frees nothing, because every candidate was retained, starts
//! a cooldown during which further passes are skipped. Passes never nest:
//! a handler that inserts into the cache does not trigger a second pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    CacheKey, CacheStats, CachedPage, EvictionDecision, EvictionHandler, EvictionHandlers,
    PageCache, Partition, StatCounters,
};
use crate::config::{EVICTION_COOLDOWN, LRU_HIGH_WATER_PERCENT, LRU_LOW_WATER_PERCENT};
use crate::PageId;

const NIL: usize = usize::MAX;

struct Node {
    key: CacheKey,
    page: CachedPage,
    prev: usize,
    next: usize,
    /// Bumped on every touch so a stale eviction candidate is recognised.
    generation: u64,
}

#[derive(Default)]
struct LruList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    head: usize,
    tail: usize,
    clock: u64,
    cooldown_until: Option<Instant>,
}

impl LruList {
    fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            ..Self::default()
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match self.node(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.node(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        self.clock += 1;
        let clock = self.clock;
        if let Some(node) = self.node(idx) {
            node.prev = NIL;
            node.next = old_head;
            node.generation = clock;
        }
        match self.node(old_head) {
            Some(h) => h.prev = idx,
            None => self.tail = idx,
        }
        self.head = idx;
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        } else {
            self.clock += 1;
            let clock = self.clock;
            if let Some(node) = self.node(idx) {
                node.generation = clock;
            }
        }
    }

    fn insert(&mut self, key: CacheKey, page: CachedPage) {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(node) = self.node(idx) {
                node.page = page;
            }
            self.touch(idx);
            return;
        }

        let node = Node {
            key: key.clone(),
            page,
            prev: NIL,
            next: NIL,
            generation: 0,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) -> Option<Node> {
        self.unlink(idx);
        let node = self.nodes.get_mut(idx).and_then(Option::take)?;
        self.index.remove(&node.key);
        self.free.push(idx);
        Some(node)
    }

    /// Keys from least to most recently used, with their generations.
    fn candidates(&self) -> Vec<(CacheKey, u64)> {
        let mut out = Vec::with_capacity(self.len());
        let mut idx = self.tail;
        while let Some(node) = self.nodes.get(idx).and_then(Option::as_ref) {
            out.push((node.key.clone(), node.generation));
            idx = node.prev;
        }
        out
    }
}

pub struct LruPageCache {
    capacity: usize,
    high_water: usize,
    low_water: usize,
    cooldown: Duration,
    list: Mutex<LruList>,
    handlers: EvictionHandlers,
    stats: StatCounters,
    evict_in_progress: AtomicBool,
}

impl LruPageCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_cooldown(capacity, EVICTION_COOLDOWN)
    }

    pub fn with_cooldown(capacity: usize, cooldown: Duration) -> Self {
        let capacity = capacity.max(1);
        let high_water = (capacity * LRU_HIGH_WATER_PERCENT / 100).max(1);
        let low_water = (capacity * LRU_LOW_WATER_PERCENT / 100).min(high_water - 1);
        Self {
            capacity,
            high_water,
            low_water,
            cooldown,
            list: Mutex::new(LruList::new()),
            handlers: EvictionHandlers::default(),
            stats: StatCounters::default(),
            evict_in_progress: AtomicBool::new(false),
        }
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    fn evict(&self) {
        if self
            .evict_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let candidates = {
            let list = self.list.lock();
            if list.len() < self.high_water {
                self.evict_in_progress.store(false, Ordering::Release);
                return;
            }
            if list.cooldown_until.is_some_and(|until| Instant::now() < until) {
                self.evict_in_progress.store(false, Ordering::Release);
                return;
            }
            list.candidates()
        };

        let mut evicted = 0usize;
        for (key, generation) in candidates {
            if self.list.lock().len() <= self.low_water {
                break;
            }

            if self.handlers.before_evict(&key) == EvictionDecision::Retain {
                self.stats.veto();
                debug!(page_id = key.page_id, partition = %key.partition, "eviction retained");
                continue;
            }

            let removed = {
                let mut list = self.list.lock();
                match list.index.get(&key).copied() {
                    Some(idx) if list.nodes[idx].as_ref().map(|n| n.generation) == Some(generation) => {
                        list.remove_slot(idx).is_some()
                    }
                    _ => false,
                }
            };
            if removed {
                evicted += 1;
                self.stats.evicted();
                self.handlers.after_evict(&key);
            }
        }

        {
            let mut list = self.list.lock();
            if evicted == 0 {
                list.cooldown_until = Some(Instant::now() + self.cooldown);
                warn!(
                    size = list.len(),
                    capacity = self.capacity,
                    "eviction pass freed no pages, backing off"
                );
            } else {
                list.cooldown_until = None;
                debug!(evicted, size = list.len(), "eviction pass complete");
            }
        }
        self.evict_in_progress.store(false, Ordering::Release);
    }
}

impl PageCache for LruPageCache {
    fn insert_or_update(&self, partition: &Partition, page: CachedPage) {
        let key = CacheKey::new(partition, page.id());
        let needs_eviction = {
            let mut list = self.list.lock();
            list.insert(key, page);
            list.len() >= self.high_water
        };
        self.stats.insert();

        if needs_eviction {
            self.evict();
        }
    }

    fn lookup(&self, partition: &Partition, page_id: PageId) -> Option<CachedPage> {
        let key = CacheKey::new(partition, page_id);
        let mut list = self.list.lock();
        match list.index.get(&key).copied() {
            Some(idx) => {
                list.touch(idx);
                self.stats.hit();
                list.node(idx).map(|n| n.page.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    fn clear(&self, partition: &Partition) {
        let mut list = self.list.lock();
        let slots: Vec<usize> = list
            .index
            .iter()
            .filter(|(key, _)| &key.partition == partition)
            .map(|(_, &idx)| idx)
            .collect();
        for idx in slots {
            list.remove_slot(idx);
        }
    }

    fn subscribe(&self, partition: &Partition, handler: Weak<dyn EvictionHandler>) {
        self.handlers.subscribe(partition, handler);
    }

    fn unsubscribe(&self, partition: &Partition) {
        self.handlers.unsubscribe(partition);
    }

    fn len(&self) -> usize {
        self.list.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{page, RecordingHandler};
    use std::sync::Arc;

    fn partition(name: &str) -> Partition {
        Arc::from(name)
    }

    #[test]
    fn lookup_hits_and_misses() {
        let cache = LruPageCache::new(10);
        let p = partition("a");
        cache.insert_or_update(&p, page(1));

        assert_eq!(cache.lookup(&p, 1).map(|pg| pg.id()), Some(1));
        assert!(cache.lookup(&p, 2).is_none());
        assert!(cache.lookup(&partition("b"), 1).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn update_replaces_existing_entry() {
        let cache = LruPageCache::new(10);
        let p = partition("a");
        cache.insert_or_update(&p, page(1));
        cache.insert_or_update(&p, page(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_drops_least_recently_used_down_to_low_water() {
        let cache = LruPageCache::new(20);
        assert_eq!(cache.high_water(), 19);
        assert_eq!(cache.low_water(), 16);

        let p = partition("a");
        for id in 1..=18 {
            cache.insert_or_update(&p, page(id));
        }
        // Touch page 1 so it is the most recent.
        assert!(cache.lookup(&p, 1).is_some());

        cache.insert_or_update(&p, page(19));
        assert_eq!(cache.len(), 16);
        assert!(cache.lookup(&p, 1).is_some());
        assert!(cache.lookup(&p, 2).is_none());
        assert!(cache.lookup(&p, 3).is_none());
        assert!(cache.lookup(&p, 4).is_none());
        assert!(cache.lookup(&p, 5).is_some());
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn size_stays_bounded() {
        let cache = LruPageCache::new(50);
        let p = partition("a");
        for id in 1..=500 {
            cache.insert_or_update(&p, page(id));
            assert!(cache.len() <= cache.high_water());
        }
    }

    #[test]
    fn handler_can_retain_pages() {
        let cache = LruPageCache::new(10);
        let p = partition("a");
        let handler = Arc::new(RecordingHandler::default());
        handler.retain.lock().insert(1);
        let weak: Weak<dyn EvictionHandler> = Arc::downgrade(&(handler.clone() as Arc<dyn EvictionHandler>));
        cache.subscribe(&p, weak);

        for id in 1..=9 {
            cache.insert_or_update(&p, page(id));
        }

        assert!(cache.lookup(&p, 1).is_some());
        assert!(cache.lookup(&p, 2).is_none());
        assert!(handler.evicted.lock().contains(&2));
        assert!(!handler.evicted.lock().contains(&1));
        assert!(cache.stats().vetoed >= 1);
    }

    #[test]
    fn fully_vetoed_pass_starts_cooldown() {
        let cache = LruPageCache::with_cooldown(10, Duration::from_secs(60));
        let p = partition("a");
        let handler = Arc::new(RecordingHandler::default());
        handler.retain.lock().extend(1..=100);
        let as_dyn: Arc<dyn EvictionHandler> = handler.clone();
        cache.subscribe(&p, Arc::downgrade(&as_dyn));

        for id in 1..=9 {
            cache.insert_or_update(&p, page(id));
        }
        let asked_after_first_pass = handler.asked.lock().len();
        assert_eq!(asked_after_first_pass, 9);

        cache.insert_or_update(&p, page(10));
        cache.insert_or_update(&p, page(11));
        assert_eq!(handler.asked.lock().len(), asked_after_first_pass);
        assert_eq!(cache.len(), 11);
    }

    #[test]
    fn clear_only_affects_one_partition() {
        let cache = LruPageCache::new(10);
        let a = partition("a");
        let b = partition("b");
        cache.insert_or_update(&a, page(1));
        cache.insert_or_update(&b, page(1));

        cache.clear(&a);
        assert!(cache.lookup(&a, 1).is_none());
        assert!(cache.lookup(&b, 1).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unsubscribed_handler_is_not_called() {
        let cache = LruPageCache::new(4);
        let p = partition("a");
        let handler: Arc<RecordingHandler> = Arc::new(RecordingHandler::default());
        let as_dyn: Arc<dyn EvictionHandler> = handler.clone();
        cache.subscribe(&p, Arc::downgrade(&as_dyn));
        cache.unsubscribe(&p);

        for id in 1..=8 {
            cache.insert_or_update(&p, page(id));
        }
        assert!(handler.asked.lock().is_empty());
    }
}
