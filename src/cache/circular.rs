//! Circular-buffer page cache.
//!
//! A fixed ring of slots with a moving insertion cursor. A new entry takes
//! the slot under the cursor; if that slot is occupied its page is evicted
//! first. A retained page keeps its slot and the cursor moves on. When every
//! slot in the ring is retained the new page is simply not cached.

use std::sync::Weak;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    CacheKey, CacheStats, CachedPage, EvictionDecision, EvictionHandler, EvictionHandlers,
    PageCache, Partition, StatCounters,
};
use crate::PageId;

struct Entry {
    key: CacheKey,
    page: CachedPage,
}

struct Ring {
    slots: Vec<Option<Entry>>,
    index: HashMap<CacheKey, usize>,
    cursor: usize,
}

impl Ring {
    fn advance(&mut self) -> usize {
        let slot = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();
        slot
    }
}

pub struct CircularBufferCache {
    capacity: usize,
    ring: Mutex<Ring>,
    handlers: EvictionHandlers,
    stats: StatCounters,
}

impl CircularBufferCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                index: HashMap::with_capacity(capacity),
                cursor: 0,
            }),
            handlers: EvictionHandlers::default(),
            stats: StatCounters::default(),
        }
    }
}

impl PageCache for CircularBufferCache {
    fn insert_or_update(&self, partition: &Partition, page: CachedPage) {
        let key = CacheKey::new(partition, page.id());

        for _ in 0..self.capacity {
            let (slot, victim) = {
                let mut ring = self.ring.lock();
                if let Some(&slot) = ring.index.get(&key) {
                    if let Some(entry) = ring.slots[slot].as_mut() {
                        entry.page = page;
                    }
                    self.stats.insert();
                    return;
                }

                let slot = ring.advance();
                match &ring.slots[slot] {
                    None => {
                        ring.slots[slot] = Some(Entry {
                            key: key.clone(),
                            page,
                        });
                        ring.index.insert(key, slot);
                        self.stats.insert();
                        return;
                    }
                    Some(entry) => (slot, entry.key.clone()),
                }
            };

            if self.handlers.before_evict(&victim) == EvictionDecision::Retain {
                self.stats.veto();
                continue;
            }

            let placed = {
                let mut ring = self.ring.lock();
                let still_there = ring.slots[slot]
                    .as_ref()
                    .is_some_and(|entry| entry.key == victim);
                if still_there && !ring.index.contains_key(&key) {
                    ring.index.remove(&victim);
                    ring.slots[slot] = Some(Entry {
                        key: key.clone(),
                        page: page.clone(),
                    });
                    ring.index.insert(key.clone(), slot);
                    true
                } else {
                    false
                }
            };

            if placed {
                self.stats.evicted();
                self.stats.insert();
                self.handlers.after_evict(&victim);
                return;
            }
        }

        debug!(
            page_id = key.page_id,
            partition = %key.partition,
            "every cache slot is retained, page not cached"
        );
    }

    fn lookup(&self, partition: &Partition, page_id: PageId) -> Option<CachedPage> {
        let key = CacheKey::new(partition, page_id);
        let ring = self.ring.lock();
        let found = ring
            .index
            .get(&key)
            .and_then(|&slot| ring.slots[slot].as_ref())
            .map(|entry| entry.page.clone());
        match found {
            Some(_) => self.stats.hit(),
            None => self.stats.miss(),
        }
        found
    }

    fn clear(&self, partition: &Partition) {
        let mut ring = self.ring.lock();
        let slots: Vec<usize> = ring
            .index
            .iter()
            .filter(|(key, _)| &key.partition == partition)
            .map(|(_, &slot)| slot)
            .collect();
        for slot in slots {
            if let Some(entry) = ring.slots[slot].take() {
                ring.index.remove(&entry.key);
            }
        }
    }

    fn subscribe(&self, partition: &Partition, handler: Weak<dyn EvictionHandler>) {
        self.handlers.subscribe(partition, handler);
    }

    fn unsubscribe(&self, partition: &Partition) {
        self.handlers.unsubscribe(partition);
    }

    fn len(&self) -> usize {
        self.ring.lock().index.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
