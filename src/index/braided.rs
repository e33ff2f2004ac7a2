// Copyright (c) 2025 braidkv contributors
//
// Braided persistent skip list.
//
// One logical list is shared by every NUMA region, but the traversal
// topology differs per region: levels 1 and above are region-local,
// reachable only from that region's head node, while level 0 is a single
// "braided" chain running through every node in key order, anchored at
// the primary region's head. Upper layers keep hot traversals inside the
// worker's NUMA region; the bottom layer is what makes the list complete.
//
// Nodes live in persistent arenas and link to each other exclusively
// through tagged (pool, offset) words, so the whole structure survives
// remapping and reopen.

use crate::error::Result;
use crate::pmem::{persist_range, sfence, PmPtr, PmemLog};
use crate::Key;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum node height, including the bottom layer.
pub const MAX_HEIGHT: usize = 15;

/// Branching factor of the height distribution.
pub const BRANCHING: u32 = 2;

/// Record operation kind, stored in the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Anchor = 0x0,
    Shortcut = 0x1,
    Value = 0x2,
    Deletion = 0x3,
}

impl OpType {
    fn from_bits(bits: u64) -> OpType {
        match bits & 0xf {
            0x0 => OpType::Anchor,
            0x1 => OpType::Shortcut,
            0x3 => OpType::Deletion,
            _ => OpType::Value,
        }
    }
}

/// Packed node tag: sequence number in the high bits, then the LSM level
/// the node belongs to, the operation kind, and the node height in the
/// low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tag(u64);

impl Tag {
    pub fn new(seq: u64, op: OpType, height: usize) -> Tag {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        Tag((seq << 12) | ((op as u64) << 4) | (height as u64 & 0xf))
    }

    pub const fn from_word(word: u64) -> Tag {
        Tag(word)
    }

    pub const fn word(self) -> u64 {
        self.0
    }

    pub const fn height(self) -> usize {
        (self.0 & 0xf) as usize
    }

    pub fn op(self) -> OpType {
        OpType::from_bits(self.0 >> 4)
    }

    /// LSM level the node currently belongs to; rewritten by compaction
    /// when the node is promoted.
    pub const fn level(self) -> usize {
        ((self.0 >> 8) & 0xf) as usize
    }

    pub const fn with_level(self, level: usize) -> Tag {
        Tag((self.0 & !0xf00) | (((level as u64) & 0xf) << 8))
    }

    pub const fn seq(self) -> u64 {
        self.0 >> 12
    }
}

/// Persistent skip-list node: fixed header plus a height-sized tail of
/// link words. The struct declares a single link; the arena allocation
/// carries `height` of them, accessed through `next()`.
#[repr(C)]
pub struct PmNode {
    pub key: Key,
    tag: AtomicU64,
    pub value: u64,
    next: [AtomicU64; 1],
}

/// Bytes of a record that must be durable before its links are: key, tag
/// and value, without the link tail.
pub const RECORD_HEADER_LEN: usize = std::mem::size_of::<PmNode>() - 8;

impl PmNode {
    /// Exact arena allocation size for a node of `height`.
    pub const fn alloc_size(height: usize) -> usize {
        std::mem::size_of::<PmNode>() + (height - 1) * 8
    }

    /// # Safety
    /// `ptr` must be null or name a node written by this crate.
    pub unsafe fn from_ptr<'a>(ptr: PmPtr) -> Option<&'a PmNode> {
        let p = ptr.resolve() as *const PmNode;
        if p.is_null() {
            None
        } else {
            Some(&*p)
        }
    }

    pub fn tag(&self) -> Tag {
        Tag::from_word(self.tag.load(Ordering::Relaxed))
    }

    pub fn set_tag(&self, tag: Tag) {
        self.tag.store(tag.word(), Ordering::Relaxed);
    }

    pub fn height(&self) -> usize {
        self.tag().height()
    }

    #[inline]
    pub fn next(&self, level: usize) -> &AtomicU64 {
        debug_assert!(level < self.height());
        unsafe { &*self.next.as_ptr().add(level) }
    }

    /// Writes a fresh redo record with the commit-marker ordering: the
    /// key becomes visible only after tag and value, so a torn record is
    /// recognizable by its zero key.
    ///
    /// # Safety
    /// `p` must point to an arena allocation of at least
    /// `alloc_size(tag.height())` zero-initialized bytes.
    pub unsafe fn write_record(p: *mut PmNode, key: Key, tag: Tag, value: u64) {
        (*p).tag.store(tag.word(), Ordering::Relaxed);
        std::ptr::addr_of_mut!((*p).value).write(value);
        sfence();
        std::ptr::addr_of_mut!((*p).key).write(key);
    }
}

/// The braided skip list proper. `bind_arena` and `init` run single-
/// threaded during table construction; `insert` and `lookup` are
/// lock-free afterwards.
pub struct BraidedSkipList {
    primary_pool: u16,
    arenas: BTreeMap<u16, Arc<PmemLog>>,
    heads: BTreeMap<u16, PmPtr>,
    primary_head: PmPtr,
}

impl BraidedSkipList {
    pub fn new(primary_pool: u16) -> Self {
        Self {
            primary_pool,
            arenas: BTreeMap::new(),
            heads: BTreeMap::new(),
            primary_head: PmPtr::NULL,
        }
    }

    pub fn bind_arena(&mut self, arena: Arc<PmemLog>) {
        self.arenas.insert(arena.pool_id(), arena);
    }

    /// Allocates one full-height head node per bound arena.
    pub fn init(&mut self) -> Result<()> {
        for (&pool_id, arena) in &self.arenas {
            let size = PmNode::alloc_size(MAX_HEIGHT);
            let head_ptr = arena.allocate(size)?;
            let head = head_ptr.resolve() as *mut PmNode;
            unsafe {
                std::ptr::write_bytes(head as *mut u8, 0, size);
                (*head)
                    .tag
                    .store(Tag::new(0, OpType::Anchor, MAX_HEIGHT).word(), Ordering::Relaxed);
            }
            arena.persist(head_ptr, size);
            self.heads.insert(pool_id, head_ptr);
        }
        self.primary_head = self
            .heads
            .get(&self.primary_pool)
            .copied()
            .unwrap_or(PmPtr::NULL);
        debug_assert!(!self.primary_head.is_null(), "primary arena not bound");
        Ok(())
    }

    pub fn primary_pool(&self) -> u16 {
        self.primary_pool
    }

    pub fn head_ptr(&self, pool_id: u16) -> PmPtr {
        self.heads.get(&pool_id).copied().unwrap_or(self.primary_head)
    }

    pub(crate) fn head(&self, pool_id: u16) -> &PmNode {
        unsafe { &*(self.head_ptr(pool_id).resolve() as *const PmNode) }
    }

    /// Links an already-written node (allocated in one of the bound
    /// arenas) into the list. The successful level-0 CAS is the
    /// linearization point; a stale successor at an upper level re-runs
    /// the position search for that level only, never the bottom one.
    pub fn insert(&self, node_ptr: PmPtr) {
        let pool_id = node_ptr.pool_id();
        let node = unsafe { &*(node_ptr.resolve() as *const PmNode) };
        let height = node.height();

        let mut preds: [*const PmNode; MAX_HEIGHT] = [std::ptr::null(); MAX_HEIGHT];
        let mut succs = [0u64; MAX_HEIGHT];

        'restart: loop {
            preds[MAX_HEIGHT - 1] = self.head(pool_id) as *const PmNode;
            self.find_position(pool_id, node.key, &mut preds, &mut succs);

            for i in 0..height {
                node.next(i).store(succs[i], Ordering::Relaxed);
            }
            sfence();

            let pred0 = unsafe { &*preds[0] };
            if pred0
                .next(0)
                .compare_exchange(succs[0], node_ptr.word(), Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                continue 'restart;
            }

            for i in 1..height {
                loop {
                    let pred = unsafe { &*preds[i] };
                    if pred
                        .next(i)
                        .compare_exchange(
                            succs[i],
                            node_ptr.word(),
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        break;
                    }
                    preds[MAX_HEIGHT - 1] = self.head(pool_id) as *const PmNode;
                    self.find_position(pool_id, node.key, &mut preds, &mut succs);
                }
            }
            break;
        }

        persist_range(node as *const PmNode as *const u8, PmNode::alloc_size(height));
    }

    /// Records, for each level, the last node with key strictly below
    /// `key` and its forward word. Starts from `preds[MAX_HEIGHT-1]`;
    /// when the upper-layer descent never left the region head, the
    /// bottom walk switches to the primary head so it covers the braided
    /// chain.
    fn find_position(
        &self,
        pool_id: u16,
        key: Key,
        preds: &mut [*const PmNode; MAX_HEIGHT],
        succs: &mut [u64; MAX_HEIGHT],
    ) {
        let mut pred = preds[MAX_HEIGHT - 1];
        let height = unsafe { (*pred).height() };

        // NUMA-local upper layers
        for i in (1..height).rev() {
            let mut curr_word;
            loop {
                curr_word = unsafe { (*pred).next(i).load(Ordering::Acquire) };
                let curr = PmPtr::from_word(curr_word).resolve() as *const PmNode;
                if !curr.is_null() && unsafe { (*curr).key } < key {
                    pred = curr;
                    continue;
                }
                break;
            }
            preds[i] = pred;
            succs[i] = curr_word;
        }

        // Braided bottom layer
        if std::ptr::eq(pred, self.head(pool_id)) {
            pred = self.head(self.primary_pool) as *const PmNode;
        }
        let mut curr_word;
        loop {
            curr_word = unsafe { (*pred).next(0).load(Ordering::Acquire) };
            let curr = PmPtr::from_word(curr_word).resolve() as *const PmNode;
            if !curr.is_null() && unsafe { (*curr).key } < key {
                pred = curr;
                continue;
            }
            break;
        }
        preds[0] = pred;
        succs[0] = curr_word;
    }

    /// Returns the tagged level-0 successor word for `key`, descending
    /// from region `pool_id`'s head. The caller compares the resolved
    /// node's key for equality.
    pub fn lookup(&self, key: Key, pool_id: u16) -> PmPtr {
        let mut pred = self.head(pool_id) as *const PmNode;
        let height = unsafe { (*pred).height() };

        for i in (1..height).rev() {
            loop {
                let curr_word = unsafe { (*pred).next(i).load(Ordering::Acquire) };
                let curr = PmPtr::from_word(curr_word).resolve() as *const PmNode;
                if !curr.is_null() && unsafe { (*curr).key } < key {
                    pred = curr;
                    continue;
                }
                break;
            }
        }

        if std::ptr::eq(pred, self.head(pool_id)) {
            pred = self.head(self.primary_pool) as *const PmNode;
        }
        let mut curr_word;
        loop {
            curr_word = unsafe { (*pred).next(0).load(Ordering::Acquire) };
            let curr = PmPtr::from_word(curr_word).resolve() as *const PmNode;
            if !curr.is_null() && unsafe { (*curr).key } < key {
                pred = curr;
                continue;
            }
            break;
        }
        PmPtr::from_word(curr_word)
    }

    /// Walks the braided bottom chain from the primary head.
    pub(crate) fn iter_bottom(&self) -> BottomIter<'_> {
        BottomIter {
            curr: PmPtr::from_word(self.head(self.primary_pool).next(0).load(Ordering::Acquire)),
            _list: self,
        }
    }
}

pub(crate) struct BottomIter<'a> {
    curr: PmPtr,
    _list: &'a BraidedSkipList,
}

impl<'a> Iterator for BottomIter<'a> {
    type Item = PmPtr;

    fn next(&mut self) -> Option<PmPtr> {
        let ptr = self.curr;
        let node = unsafe { PmNode::from_ptr(ptr) }?;
        self.curr = PmPtr::from_word(node.next(0).load(Ordering::Acquire));
        Some(ptr)
    }
}
