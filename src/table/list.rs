// Newest-first table list, one per (level, shard).
//
// The head pointer and the internal links are mutated only by CAS;
// unlinked nodes go to the epoch reclaimer so readers holding a guard
// never see freed memory. Mid-list unlinks are only performed by the
// per-shard flush/compaction maintenance path, which is externally
// serialized; pushes at the head race freely with it.

use super::memtable::MemTable;
use super::pmemtable::PmemTable;
use crossbeam::epoch::{self, Atomic, Guard, Owned};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Table-list entry. The fast path branches on the discriminator once
/// per table visited; there is no polymorphic dispatch.
#[derive(Clone)]
pub enum Table {
    Mem(Arc<MemTable>),
    Pmem(Arc<PmemTable>),
}

impl Table {
    pub fn as_mem(&self) -> Option<&Arc<MemTable>> {
        match self {
            Table::Mem(m) => Some(m),
            Table::Pmem(_) => None,
        }
    }

    pub fn as_pmem(&self) -> Option<&Arc<PmemTable>> {
        match self {
            Table::Pmem(p) => Some(p),
            Table::Mem(_) => None,
        }
    }
}

struct ListNode {
    table: Table,
    next: Atomic<ListNode>,
}

pub struct TableList {
    head: Atomic<ListNode>,
}

impl TableList {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Publishes `table` as the newest entry.
    pub fn push_front(&self, table: Table) {
        let guard = epoch::pin();
        let mut node = Owned::new(ListNode {
            table,
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    /// Inserts a persistent table at the MemTable/PmemTable boundary:
    /// after every MemTable, before every older PmemTable. Used by flush,
    /// whose table is older than all live MemTables but newer than all
    /// published persistent tables.
    pub fn insert_pmem_front(&self, table: Arc<PmemTable>) {
        let guard = epoch::pin();
        let mut node = Owned::new(ListNode {
            table: Table::Pmem(table),
            next: Atomic::null(),
        });
        'retry: loop {
            let mut prev_link = &self.head;
            let mut curr = prev_link.load(Ordering::Acquire, &guard);
            while let Some(n) = unsafe { curr.as_ref() } {
                if matches!(n.table, Table::Pmem(_)) {
                    break;
                }
                prev_link = &n.next;
                curr = prev_link.load(Ordering::Acquire, &guard);
            }
            node.next.store(curr, Ordering::Relaxed);
            match prev_link.compare_exchange(
                curr,
                node,
                Ordering::Release,
                Ordering::Relaxed,
                &guard,
            ) {
                Ok(_) => return,
                Err(e) => {
                    node = e.new;
                    continue 'retry;
                }
            }
        }
    }

    pub fn front<'g>(&self, guard: &'g Guard) -> Option<&'g Table> {
        unsafe { self.head.load(Ordering::Acquire, guard).as_ref() }.map(|n| &n.table)
    }

    pub fn iter<'g>(&self, guard: &'g Guard) -> TableIter<'g> {
        TableIter {
            curr: self.head.load(Ordering::Acquire, guard).as_raw() as usize,
            guard,
        }
    }

    /// Unlinks the first entry matching `pred` and hands its node to the
    /// epoch reclaimer. Returns false if nothing matched.
    pub fn retire_where<F>(&self, pred: F, guard: &Guard) -> bool
    where
        F: Fn(&Table) -> bool,
    {
        'retry: loop {
            let mut prev_link = &self.head;
            let mut curr = prev_link.load(Ordering::Acquire, guard);
            while let Some(n) = unsafe { curr.as_ref() } {
                if pred(&n.table) {
                    let next = n.next.load(Ordering::Acquire, guard);
                    match prev_link.compare_exchange(
                        curr,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            unsafe { guard.defer_destroy(curr) };
                            return true;
                        }
                        Err(_) => continue 'retry,
                    }
                }
                prev_link = &n.next;
                curr = prev_link.load(Ordering::Acquire, guard);
            }
            return false;
        }
    }

    /// Replaces the whole list with a single entry; the old chain is
    /// epoch-reclaimed.
    pub fn replace_all(&self, table: Table, guard: &Guard) {
        let node = Owned::new(ListNode {
            table,
            next: Atomic::null(),
        });
        let mut old = self.head.swap(node, Ordering::AcqRel, guard);
        while let Some(n) = unsafe { old.as_ref() } {
            let next = n.next.load(Ordering::Acquire, guard);
            unsafe { guard.defer_destroy(old) };
            old = next;
        }
    }

    pub fn count_mem(&self, guard: &Guard) -> usize {
        self.iter(guard)
            .filter(|t| matches!(t, Table::Mem(_)))
            .count()
    }

    pub fn len(&self, guard: &Guard) -> usize {
        self.iter(guard).count()
    }

    pub fn is_empty(&self, guard: &Guard) -> bool {
        self.front(guard).is_none()
    }
}

impl Default for TableList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TableList {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.head.load(Ordering::Relaxed, guard);
            while !curr.is_null() {
                let next = curr.as_ref().unwrap().next.load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}

pub struct TableIter<'g> {
    curr: usize,
    guard: &'g Guard,
}

impl<'g> Iterator for TableIter<'g> {
    type Item = &'g Table;

    fn next(&mut self) -> Option<&'g Table> {
        let node = unsafe { (self.curr as *const ListNode).as_ref() }?;
        self.curr = node.next.load(Ordering::Acquire, self.guard).as_raw() as usize;
        Some(&node.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> Table {
        Table::Mem(Arc::new(MemTable::new(1024)))
    }

    #[test]
    fn test_push_front_newest_first() {
        let list = TableList::new();
        let guard = epoch::pin();
        let a = Arc::new(MemTable::new(1));
        let b = Arc::new(MemTable::new(2));
        list.push_front(Table::Mem(Arc::clone(&a)));
        list.push_front(Table::Mem(Arc::clone(&b)));

        let fronts: Vec<usize> = list
            .iter(&guard)
            .map(|t| t.as_mem().unwrap().capacity())
            .collect();
        assert_eq!(fronts, vec![2, 1]);
    }

    #[test]
    fn test_retire_unlinks_target() {
        let list = TableList::new();
        let guard = epoch::pin();
        let victim = Arc::new(MemTable::new(7));
        list.push_front(mem());
        list.push_front(Table::Mem(Arc::clone(&victim)));
        list.push_front(mem());
        assert_eq!(list.len(&guard), 3);

        let removed = list.retire_where(
            |t| t.as_mem().map_or(false, |m| Arc::ptr_eq(m, &victim)),
            &guard,
        );
        assert!(removed);
        assert_eq!(list.len(&guard), 2);
        assert!(!list.retire_where(
            |t| t.as_mem().map_or(false, |m| Arc::ptr_eq(m, &victim)),
            &guard,
        ));
    }

    #[test]
    fn test_insert_pmem_front_respects_boundary() {
        use crate::index::braided::BraidedSkipList;
        use crate::pmem::{Pool, PmemLog};

        let log = Arc::new(PmemLog::new(Arc::new(Pool::anonymous(1 << 16).unwrap())));
        let make_pmem = || {
            let mut sl = BraidedSkipList::new(log.pool_id());
            sl.bind_arena(Arc::clone(&log));
            sl.init().unwrap();
            Arc::new(PmemTable::new(sl))
        };

        let list = TableList::new();
        let guard = epoch::pin();
        list.push_front(mem());
        list.insert_pmem_front(make_pmem());
        list.push_front(mem());
        list.insert_pmem_front(make_pmem());

        let kinds: Vec<bool> = list.iter(&guard).map(|t| t.as_mem().is_some()).collect();
        // Both memtables stay ahead of both persistent tables.
        assert_eq!(kinds, vec![true, true, false, false]);
        assert_eq!(list.count_mem(&guard), 2);
    }

    #[test]
    fn test_replace_all() {
        let list = TableList::new();
        let guard = epoch::pin();
        list.push_front(mem());
        list.push_front(mem());
        list.replace_all(mem(), &guard);
        assert_eq!(list.len(&guard), 1);
    }

    #[test]
    fn test_concurrent_push_front() {
        use std::thread;

        let list = Arc::new(TableList::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    list.push_front(mem());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let guard = epoch::pin();
        assert_eq!(list.len(&guard), 400);
    }
}
