// Per-shard hash cache over flushed records, consulted between the
// MemTables and the persistent L0 search. Values are tagged-pointer
// words of redo records; flush upserts the newest version of each key it
// installs, so a hit is never staler than the persistent levels it
// shadows.

use crate::Key;
use dashmap::DashMap;

pub struct HashCache {
    map: DashMap<Key, u64>,
    capacity: usize,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            capacity,
        }
    }

    /// Tagged-pointer word of the newest flushed record for `key`.
    pub fn get(&self, key: Key) -> Option<u64> {
        self.map.get(&key).map(|e| *e)
    }

    pub fn insert(&self, key: Key, word: u64) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            // Full: keep serving the resident set rather than churning.
            return;
        }
        self.map.insert(key, word);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
