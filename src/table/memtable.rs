// Volatile sorted table front-ending the persistent log.

use crate::index::memsl::MemSkipList;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// MemTable lifecycle. Sealing flips Active to Immutable; a flush worker
/// claims Immutable tables; Flushed tables are unlinked and reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TableState {
    Active = 0,
    Immutable = 1,
    Flushing = 2,
    Flushed = 3,
}

impl TableState {
    fn from_u32(v: u32) -> TableState {
        match v {
            0 => TableState::Active,
            1 => TableState::Immutable,
            2 => TableState::Flushing,
            _ => TableState::Flushed,
        }
    }
}

pub struct MemTable {
    skiplist: MemSkipList,
    bytes_used: AtomicUsize,
    capacity: usize,
    write_refs: AtomicU32,
    state: AtomicU32,
}

impl MemTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            skiplist: MemSkipList::new(),
            bytes_used: AtomicUsize::new(0),
            capacity,
            write_refs: AtomicU32::new(0),
            state: AtomicU32::new(TableState::Active as u32),
        }
    }

    pub fn skiplist(&self) -> &MemSkipList {
        &self.skiplist
    }

    pub fn state(&self) -> TableState {
        TableState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn cas_state(&self, from: TableState, to: TableState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_state(&self, to: TableState) {
        self.state.store(to as u32, Ordering::Release);
    }

    /// Writer reference, held across locating the table and inserting.
    /// The sealer waits for zero before a claimed table may be flushed.
    pub fn w_ref(&self) {
        self.write_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn w_unref(&self) {
        self.write_refs.fetch_sub(1, Ordering::Release);
    }

    pub fn write_refs(&self) -> u32 {
        self.write_refs.load(Ordering::Acquire)
    }

    /// Accounts `bytes` against the capacity; false means the table is
    /// full and must be sealed.
    pub fn reserve(&self, bytes: usize) -> bool {
        let prev = self.bytes_used.fetch_add(bytes, Ordering::Relaxed);
        if prev + bytes <= self.capacity {
            true
        } else {
            self.bytes_used.fetch_sub(bytes, Ordering::Relaxed);
            false
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_used() == 0
    }
}

/// RAII writer handle returned by `Db::get_writable_memtable`; drops the
/// writer reference when the insert critical section ends.
pub struct WritableMem {
    table: Arc<MemTable>,
}

impl WritableMem {
    pub(crate) fn new(table: Arc<MemTable>) -> Self {
        Self { table }
    }
}

impl std::ops::Deref for WritableMem {
    type Target = MemTable;

    fn deref(&self) -> &MemTable {
        &self.table
    }
}

impl Drop for WritableMem {
    fn drop(&mut self) {
        self.table.w_unref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let m = MemTable::new(1024);
        assert_eq!(m.state(), TableState::Active);
        assert!(m.cas_state(TableState::Active, TableState::Immutable));
        assert!(!m.cas_state(TableState::Active, TableState::Immutable));
        assert!(m.cas_state(TableState::Immutable, TableState::Flushing));
        m.set_state(TableState::Flushed);
        assert_eq!(m.state(), TableState::Flushed);
    }

    #[test]
    fn test_reserve_capacity() {
        let m = MemTable::new(64);
        assert!(m.reserve(48));
        assert!(m.reserve(16));
        assert!(!m.reserve(1));
        assert_eq!(m.bytes_used(), 64);
    }

    #[test]
    fn test_writer_refs() {
        let m = Arc::new(MemTable::new(1024));
        {
            let w = WritableMem::new(Arc::clone(&m));
            assert_eq!(w.write_refs(), 0);
            m.w_ref();
            assert_eq!(m.write_refs(), 1);
        }
        // WritableMem dropped one reference on behalf of the writer.
        assert_eq!(m.write_refs(), 0);
    }
}
