// Engine core: per-shard arenas, table lists and caches, the writable-
// memtable protocol, and the table-lifecycle primitives the flush and
// compaction workers drive.

use crate::cache::{HashCache, LruPredecessorCache};
use crate::error::{KvError, Result};
use crate::index::braided::{BraidedSkipList, PmNode, RECORD_HEADER_LEN};
use crate::pmem::{persist_range, PmPtr, Pool, PmemLog};
use crate::recovery;
use crate::table::{MemTable, PmemTable, Table, TableList, TableState, WritableMem};
use crate::util::Backoff;
use crate::Key;
use crossbeam::epoch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Engine configuration. `MAX_HEIGHT` and the branching factor are
/// compile-time constants; everything workload-shaped is set here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// NUMA regions; each owns one arena per shard.
    pub num_regions: usize,
    /// Key-space partitions.
    pub num_shards: usize,
    /// Seal threshold per MemTable, in bytes.
    pub memtable_capacity: usize,
    /// MemTables allowed per shard before writers block.
    pub max_memtables: usize,
    /// Arena bytes per (region, shard) pool.
    pub pool_size: usize,
    /// Sampling period of the level-tag check in L0 searches; 1 samples
    /// every visited node.
    pub level_check_period: u32,
    /// Put records buffered per shard before one grouped log append;
    /// 0 disables batching.
    pub group_logging: usize,
    /// Entries per (shard, region) L1 predecessor cache; 0 disables.
    pub lru_cache_capacity: usize,
    /// Entries per shard in the advisory hash cache; 0 disables.
    pub hash_cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_regions: 2,
            num_shards: 128,
            memtable_capacity: 128 << 20,
            max_memtables: 8,
            pool_size: 256 << 20,
            level_check_period: 1,
            group_logging: 0,
            lru_cache_capacity: 1024,
            hash_cache_capacity: 0,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<()> {
        if self.num_regions == 0 || self.num_shards == 0 {
            return Err(KvError::Configuration(
                "num_regions and num_shards must be positive".into(),
            ));
        }
        if self.max_memtables == 0 || self.memtable_capacity < 64 {
            return Err(KvError::Configuration(
                "memtable capacity must hold at least one record".into(),
            ));
        }
        if self.level_check_period == 0 {
            return Err(KvError::Configuration(
                "level_check_period must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct Shard {
    /// One log per region, region-indexed.
    logs: Vec<Arc<PmemLog>>,
    l0: TableList,
    l1: TableList,
    /// Region-indexed L1 predecessor hints.
    lru: Vec<LruPredecessorCache>,
    hash_cache: Option<HashCache>,
    /// Serializes seal/install decisions; never held on the put path.
    maint: Mutex<()>,
}

#[derive(Debug, Clone, Default)]
pub struct DbStats {
    pub memtables: usize,
    pub l0_tables: usize,
    pub l1_tables: usize,
}

pub struct Db {
    opts: Options,
    shards: Vec<Shard>,
    seq: AtomicU64,
}

impl Db {
    /// Opens (or creates) a durable engine under `dir`: one pool file per
    /// (region, shard). Existing pools are scanned and their committed
    /// records rebuilt into an L0 table per shard.
    pub fn open(dir: impl AsRef<Path>, opts: Options) -> Result<Db> {
        opts.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Self::build(opts, |region, shard, size| {
            let path = dir.join(format!("r{}_s{}.pool", region, shard));
            if path.exists() {
                Pool::open(&path)
            } else {
                Pool::create(&path, size)
            }
        })
    }

    /// Builds a volatile engine over anonymous pools. Used by tests and
    /// benchmarks; semantics match `open` minus durability.
    pub fn volatile(opts: Options) -> Result<Db> {
        opts.validate()?;
        Self::build(opts, |_, _, size| Pool::anonymous(size))
    }

    fn build<F>(opts: Options, mut make_pool: F) -> Result<Db>
    where
        F: FnMut(usize, usize, usize) -> Result<Pool>,
    {
        let mut shards = Vec::with_capacity(opts.num_shards);
        for s in 0..opts.num_shards {
            let mut logs = Vec::with_capacity(opts.num_regions);
            let mut recovered = Vec::new();
            for r in 0..opts.num_regions {
                let pool = Arc::new(make_pool(r, s, opts.pool_size)?);
                let (records, tail) = recovery::scan_log(&pool);
                recovered.extend(records);
                logs.push(Arc::new(PmemLog::recovered(pool, tail)));
            }

            let shard = Shard {
                lru: (0..opts.num_regions)
                    .map(|_| LruPredecessorCache::new(opts.lru_cache_capacity))
                    .collect(),
                hash_cache: (opts.hash_cache_capacity > 0)
                    .then(|| HashCache::new(opts.hash_cache_capacity)),
                l0: TableList::new(),
                l1: TableList::new(),
                maint: Mutex::new(()),
                logs,
            };

            if !recovered.is_empty() {
                // Oldest first, so the newest version of a key ends up
                // nearest the head.
                recovered.sort_by_key(|r| r.seq);
                let mut sl = BraidedSkipList::new(shard.logs[0].pool_id());
                for log in &shard.logs {
                    sl.bind_arena(Arc::clone(log));
                }
                sl.init()?;
                for record in &recovered {
                    sl.insert(record.ptr);
                }
                debug!(shard = s, records = recovered.len(), "rebuilt L0 from log");
                shard.l0.push_front(Table::Pmem(Arc::new(PmemTable::new(sl))));
            }
            shard
                .l0
                .push_front(Table::Mem(Arc::new(MemTable::new(opts.memtable_capacity))));

            shards.push(shard);
        }

        Ok(Db {
            opts,
            shards,
            seq: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn num_shards(&self) -> usize {
        self.opts.num_shards
    }

    pub fn num_regions(&self) -> usize {
        self.opts.num_regions
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn log(&self, region: usize, shard: usize) -> &Arc<PmemLog> {
        &self.shards[shard].logs[region]
    }

    pub(crate) fn table_list(&self, level: usize, shard: usize) -> &TableList {
        match level {
            0 => &self.shards[shard].l0,
            _ => &self.shards[shard].l1,
        }
    }

    pub fn lru_cache(&self, shard: usize, region: usize) -> &LruPredecessorCache {
        &self.shards[shard].lru[region]
    }

    pub fn hash_cache(&self, shard: usize) -> Option<&HashCache> {
        self.shards[shard].hash_cache.as_ref()
    }

    pub fn stats(&self) -> DbStats {
        let guard = epoch::pin();
        let mut stats = DbStats::default();
        for shard in &self.shards {
            stats.memtables += shard.l0.count_mem(&guard);
            stats.l0_tables += shard.l0.len(&guard) - shard.l0.count_mem(&guard);
            stats.l1_tables += shard.l1.len(&guard);
        }
        stats
    }

    /// Returns the shard's Active MemTable with a writer reference held
    /// and `kv_size` bytes reserved. Blocks (the only blocking point on
    /// the hot path) while every slot is Immutable or Flushing.
    pub(crate) fn get_writable_memtable(&self, kv_size: usize, shard: usize) -> WritableMem {
        let sh = &self.shards[shard];
        let mut backoff = Backoff::new();
        loop {
            {
                let guard = epoch::pin();
                match sh.l0.front(&guard) {
                    Some(Table::Mem(m)) if m.state() == TableState::Active => {
                        m.w_ref();
                        if m.state() == TableState::Active {
                            if m.reserve(kv_size) {
                                return WritableMem::new(Arc::clone(m));
                            }
                            m.w_unref();
                            self.seal_front(shard, Some(m));
                            self.install_active(shard);
                            continue;
                        }
                        // Lost the race with a sealer.
                        m.w_unref();
                    }
                    _ => {
                        self.install_active(shard);
                        continue;
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Seals the shard's Active MemTable. With `full` set, only if it
    /// still is the table the caller saw fill up; otherwise any
    /// non-empty Active front. Never waits.
    fn seal_front(&self, shard: usize, full: Option<&Arc<MemTable>>) {
        let sh = &self.shards[shard];
        let _m = sh.maint.lock();
        let guard = epoch::pin();
        if let Some(Table::Mem(m)) = sh.l0.front(&guard) {
            if m.state() == TableState::Active {
                match full {
                    Some(f) if !Arc::ptr_eq(f, m) => return,
                    None if m.is_empty() => return,
                    _ => {}
                }
                m.cas_state(TableState::Active, TableState::Immutable);
            }
        }
    }

    /// Installs a fresh Active MemTable at the front once a slot is
    /// free. Writers block here (and only here) while every slot is
    /// Immutable or Flushing; the flush worker never does, so it can
    /// drain tables while writers wait.
    fn install_active(&self, shard: usize) {
        let sh = &self.shards[shard];
        let mut backoff = Backoff::new();
        loop {
            {
                let guard = epoch::pin();
                if matches!(sh.l0.front(&guard), Some(Table::Mem(m)) if m.state() == TableState::Active)
                {
                    return;
                }
                if sh.l0.count_mem(&guard) < self.opts.max_memtables {
                    let _m = sh.maint.lock();
                    let front_active = matches!(sh.l0.front(&guard), Some(Table::Mem(m)) if m.state() == TableState::Active);
                    if !front_active && sh.l0.count_mem(&guard) < self.opts.max_memtables {
                        sh.l0
                            .push_front(Table::Mem(Arc::new(MemTable::new(
                                self.opts.memtable_capacity,
                            ))));
                        return;
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Seals the current Active MemTable so a flush can pick it up.
    /// Writers install the replacement on their next put.
    pub fn seal_active(&self, shard: usize) {
        self.seal_front(shard, None);
    }

    // ---- flush worker interface ----

    /// Claims the oldest Immutable MemTable of `shard`, waiting out any
    /// writer that raced in before the seal.
    pub fn acquire_immutable(&self, shard: usize) -> Option<Arc<MemTable>> {
        let mem = {
            let guard = epoch::pin();
            let mut oldest = None;
            for table in self.shards[shard].l0.iter(&guard) {
                if let Table::Mem(m) = table {
                    if m.state() == TableState::Immutable {
                        oldest = Some(Arc::clone(m));
                    }
                }
            }
            oldest?
        };
        if !mem.cas_state(TableState::Immutable, TableState::Flushing) {
            return None;
        }
        let mut backoff = Backoff::new();
        while mem.write_refs() != 0 {
            backoff.snooze();
        }
        Some(mem)
    }

    /// Publishes a flushed table at the L0 MemTable/PmemTable boundary.
    pub fn publish_l0(&self, shard: usize, table: Arc<PmemTable>) {
        self.shards[shard].l0.insert_pmem_front(table);
    }

    /// Unlinks a Flushed MemTable; reclamation happens after the epoch
    /// grace period.
    pub fn retire(&self, shard: usize, mem: &Arc<MemTable>) {
        debug_assert_eq!(mem.state(), TableState::Flushed);
        let guard = epoch::pin();
        self.shards[shard].l0.retire_where(
            |t| t.as_mem().map_or(false, |m| Arc::ptr_eq(m, mem)),
            &guard,
        );
    }

    /// Seals the Active table, then drains every Immutable MemTable of
    /// the shard into L0. Returns the number of records installed.
    pub fn flush_shard(&self, shard: usize) -> Result<usize> {
        self.seal_active(shard);
        let mut flushed = 0;
        while let Some(mem) = self.acquire_immutable(shard) {
            flushed += self.flush_memtable(shard, &mem)?;
            mem.set_state(TableState::Flushed);
            self.retire(shard, &mem);
        }
        Ok(flushed)
    }

    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for s in 0..self.opts.num_shards {
            flushed += self.flush_shard(s)?;
        }
        Ok(flushed)
    }

    /// Installs a MemTable's backing redo records into a fresh braided
    /// list. The records are not copied: each was allocated with its
    /// link tail at put time and now becomes an L0 index node.
    fn flush_memtable(&self, shard: usize, mem: &MemTable) -> Result<usize> {
        let sh = &self.shards[shard];
        let mut sl = self.make_braided(shard)?;
        sl.init()?;

        let mut count = 0usize;
        let mut last_key = Key::ZERO;
        for node in mem.skiplist().iter() {
            // Equal keys sit newest-first; older versions are dead.
            if node.key == last_key {
                continue;
            }
            last_key = node.key;
            sl.insert(PmPtr::from_word(node.value));
            if let Some(ht) = &sh.hash_cache {
                ht.insert(node.key, node.value);
            }
            count += 1;
        }

        if count > 0 {
            self.publish_l0(shard, Arc::new(PmemTable::new(sl)));
        }
        debug!(shard, records = count, "memtable flush complete");
        Ok(count)
    }

    // ---- compaction interface ----

    /// Persistent L0 tables of `shard`, newest first.
    pub fn snapshot_l0(&self, shard: usize) -> Vec<Arc<PmemTable>> {
        let guard = epoch::pin();
        self.shards[shard]
            .l0
            .iter(&guard)
            .filter_map(|t| t.as_pmem().cloned())
            .collect()
    }

    pub fn replace_l1(&self, shard: usize, table: Arc<PmemTable>) {
        let guard = epoch::pin();
        let l1 = &self.shards[shard].l1;
        if l1.is_empty(&guard) {
            l1.push_front(Table::Pmem(table));
        } else {
            l1.replace_all(Table::Pmem(table), &guard);
        }
    }

    pub fn retire_l0(&self, shard: usize, table: &Arc<PmemTable>) {
        let guard = epoch::pin();
        self.shards[shard].l0.retire_where(
            |t| t.as_pmem().map_or(false, |p| Arc::ptr_eq(p, table)),
            &guard,
        );
    }

    /// Merges every persistent L0 table of `shard` into L1, oldest table
    /// first so newer versions of a key land nearer the head. Nodes move
    /// by link rewriting; the level stamp in their tags lets concurrent
    /// L0 searches detect the promotion and fall through to L1.
    pub fn compact_shard(&self, shard: usize) -> Result<usize> {
        let snapshot = self.snapshot_l0(shard);
        if snapshot.is_empty() {
            return Ok(0);
        }
        let sh = &self.shards[shard];

        let l1 = {
            let guard = epoch::pin();
            match sh.l1.front(&guard).and_then(|t| t.as_pmem()) {
                Some(p) => Arc::clone(p),
                None => {
                    let mut sl = self.make_braided(shard)?;
                    sl.init()?;
                    let table = Arc::new(PmemTable::new(sl));
                    self.replace_l1(shard, Arc::clone(&table));
                    table
                }
            }
        };

        let mut merged = 0usize;
        for table in snapshot.iter().rev() {
            let nodes: Vec<PmPtr> = table.skiplist().iter_bottom().collect();
            for ptr in &nodes {
                let node = match unsafe { PmNode::from_ptr(*ptr) } {
                    Some(n) => n,
                    None => continue,
                };
                // Stamp and persist the level before linking so an L0
                // search never follows a promoted node unawares.
                node.set_tag(node.tag().with_level(1));
                persist_range(node as *const PmNode as *const u8, RECORD_HEADER_LEN);
                l1.skiplist().insert(*ptr);
                if node.height() >= 2 {
                    if let Some(region) =
                        sh.logs.iter().position(|l| l.pool_id() == ptr.pool_id())
                    {
                        sh.lru[region].insert(node.key, ptr.word());
                    }
                }
                merged += 1;
            }
            self.retire_l0(shard, table);
        }

        debug!(shard, records = merged, "L0 compaction complete");
        Ok(merged)
    }

    fn make_braided(&self, shard: usize) -> Result<BraidedSkipList> {
        let sh = &self.shards[shard];
        let mut sl = BraidedSkipList::new(sh.logs[0].pool_id());
        for log in &sh.logs {
            sl.bind_arena(Arc::clone(log));
        }
        Ok(sl)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        for shard in &self.shards {
            for log in &shard.logs {
                log.sync_tail_hint();
            }
        }
    }
}
