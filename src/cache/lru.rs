// Per-(shard, region) LRU of known L1 predecessors.
//
// `find_less_than` hands back a tagged pointer to a node whose key is
// strictly below the probe, which is a legal starting point for any
// skip-list descent and saves the upper-layer walk from the head.

use crate::Key;
use parking_lot::Mutex;
use std::collections::BTreeMap;

struct CacheEntry {
    word: u64,
    stamp: u64,
}

struct LruInner {
    map: BTreeMap<Key, CacheEntry>,
    tick: u64,
}

pub struct LruPredecessorCache {
    capacity: usize,
    inner: Mutex<LruInner>,
}

impl LruPredecessorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruInner {
                map: BTreeMap::new(),
                tick: 0,
            }),
        }
    }

    /// Tagged-pointer word of a cached node with key strictly below
    /// `key`, or 0.
    pub fn find_less_than(&self, key: Key) -> u64 {
        if self.capacity == 0 {
            return 0;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some((_, entry)) = inner.map.range_mut(..key).next_back() {
            entry.stamp = tick;
            entry.word
        } else {
            0
        }
    }

    pub fn insert(&self, key: Key, word: u64) {
        if self.capacity == 0 || key.is_zero() || word == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let stamp = inner.tick;
        if inner.map.len() >= self.capacity && !inner.map.contains_key(&key) {
            // Evict the least recently touched entry. The cache is small
            // and insertions come from the compaction path only.
            if let Some(victim) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| *k)
            {
                inner.map.remove(&victim);
            }
        }
        inner.map.insert(key, CacheEntry { word, stamp });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
