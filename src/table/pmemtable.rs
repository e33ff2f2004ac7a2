// Persistent table: a braided skip list plus its per-pool head nodes,
// read-only once attached to a table list.

use crate::index::braided::BraidedSkipList;

pub struct PmemTable {
    skiplist: BraidedSkipList,
}

impl PmemTable {
    pub fn new(skiplist: BraidedSkipList) -> Self {
        Self { skiplist }
    }

    pub fn skiplist(&self) -> &BraidedSkipList {
        &self.skiplist
    }
}
