// Per-worker client handle.
//
// A client belongs to one NUMA region: its puts append to the region's
// shard-affine logs and its persistent-table searches descend from the
// region's heads. The height generator and the lookup statistics are
// worker-local, so client methods take `&mut self` and a client is
// driven by exactly one thread.

use crate::db::Db;
use crate::error::{KvError, Result};
use crate::index::braided::{
    BraidedSkipList, OpType, PmNode, Tag, BRANCHING, MAX_HEIGHT, RECORD_HEADER_LEN,
};
use crate::index::memsl::MemNode;
use crate::pmem::{PmPtr, PmemLog};
use crate::table::Table;
use crate::util::align8;
use crate::{Key, Value};
use crossbeam::epoch;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

enum L0Search {
    Hit(PmPtr),
    /// The search met a node promoted past the table's level; retry
    /// against the next table in the list.
    Promoted,
}

struct GroupItem {
    key: Key,
    tag: Tag,
    value: Value,
}

pub struct Client {
    db: Arc<Db>,
    id: u64,
    region: usize,
    rng: SmallRng,
    /// Shard-indexed logs of this client's region.
    logs: Vec<Arc<PmemLog>>,
    groups: Vec<Vec<GroupItem>>,
    pmem_get_cnt: u64,
    search_visit_cnt: u64,
    height_visit_cnt: [u64; MAX_HEIGHT],
}

impl Client {
    pub fn new(db: Arc<Db>, id: u64, region: usize) -> Client {
        assert!(region < db.num_regions(), "region out of range");
        let logs = (0..db.num_shards())
            .map(|s| Arc::clone(db.log(region, s)))
            .collect();
        let groups = (0..db.num_shards()).map(|_| Vec::new()).collect();
        Client {
            rng: SmallRng::seed_from_u64(id),
            logs,
            groups,
            db,
            id,
            region,
            pmem_get_cnt: 0,
            search_visit_cnt: 0,
            height_visit_cnt: [0; MAX_HEIGHT],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn region(&self) -> usize {
        self.region
    }

    pub fn set_region(&mut self, region: usize) {
        self.region = region;
        self.logs = (0..self.db.num_shards())
            .map(|s| Arc::clone(self.db.log(region, s)))
            .collect();
    }

    pub fn pmem_get_count(&self) -> u64 {
        self.pmem_get_cnt
    }

    pub fn search_visit_count(&self) -> u64 {
        self.search_visit_cnt
    }

    pub fn height_visit_count(&self, height: usize) -> u64 {
        self.height_visit_cnt[height]
    }

    fn shard_of(&self, key: Key) -> usize {
        (key.shard_number() % self.db.num_shards() as u64) as usize
    }

    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        self.write(key, value, OpType::Value)
    }

    /// A delete is a put whose record carries the deletion op; readers
    /// treat the newest version being a deletion as absence.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.write(key, 0, OpType::Deletion)
    }

    fn write(&mut self, key: Key, value: Value, op: OpType) -> Result<()> {
        if key.is_zero() {
            return Err(KvError::InvalidKey("key 0 is reserved".into()));
        }
        let shard = self.shard_of(key);
        let height = self.random_height();
        let tag = Tag::new(self.db.next_seq(), op, height);

        let batch = self.db.options().group_logging;
        if batch > 0 {
            self.groups[shard].push(GroupItem { key, tag, value });
            if self.groups[shard].len() >= batch {
                self.flush_group(shard)?;
            }
            return Ok(());
        }

        let ptr = self.append_record(shard, key, tag, value)?;
        self.install_mem_node(shard, key, tag, ptr)
    }

    /// Appends one redo record: tag and value first, a store fence, then
    /// the key as the commit marker, then the writeback of the header.
    fn append_record(&self, shard: usize, key: Key, tag: Tag, value: Value) -> Result<PmPtr> {
        let ptr = self.logs[shard].allocate(PmNode::alloc_size(tag.height()))?;
        unsafe { PmNode::write_record(ptr.resolve() as *mut PmNode, key, tag, value) };
        self.logs[shard].persist(ptr, RECORD_HEADER_LEN);
        Ok(ptr)
    }

    fn install_mem_node(&self, shard: usize, key: Key, tag: Tag, record: PmPtr) -> Result<()> {
        let kv_size = std::mem::size_of::<Key>() + std::mem::size_of::<Value>();
        let mem = self.db.get_writable_memtable(kv_size, shard);
        let node = MemNode::alloc(key, tag, record.word(), tag.height());
        mem.skiplist().insert(node);
        Ok(())
    }

    /// Drains one shard's buffered puts through a single contiguous log
    /// extent. A batched put becomes visible to readers only here, at
    /// its MemNode insert.
    fn flush_group(&mut self, shard: usize) -> Result<()> {
        if self.groups[shard].is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut self.groups[shard]);
        let total: usize = items
            .iter()
            .map(|it| align8(PmNode::alloc_size(it.tag.height())))
            .sum();
        let extent = self.logs[shard].allocate(total)?;
        let pool_id = extent.pool_id();

        let mut va = extent.resolve();
        let mut records = Vec::with_capacity(items.len());
        for it in &items {
            unsafe { PmNode::write_record(va as *mut PmNode, it.key, it.tag, it.value) };
            records.push(PmPtr::from_va(pool_id, va));
            va = unsafe { va.add(align8(PmNode::alloc_size(it.tag.height()))) };
        }
        self.logs[shard].persist(extent, total);

        for (it, record) in items.iter().zip(records) {
            self.install_mem_node(shard, it.key, it.tag, record)?;
        }
        Ok(())
    }

    /// Flushes every buffered put. Callers using group logging should
    /// invoke this before expecting their writes to be readable.
    pub fn flush_batches(&mut self) -> Result<()> {
        for shard in 0..self.groups.len() {
            self.flush_group(shard)?;
        }
        Ok(())
    }

    /// Point lookup: L0 front-to-back (MemTables, then the advisory hash
    /// cache, then persistent L0 tables), then L1 with the LRU hint.
    pub fn get(&mut self, key: Key) -> Option<Value> {
        let shard = self.shard_of(key);
        let db = Arc::clone(&self.db);
        let guard = epoch::pin();

        let mut iter = db.table_list(0, shard).iter(&guard);
        let mut first_pmem = None;
        for table in iter.by_ref() {
            match table {
                Table::Mem(m) => {
                    if let Some(node) = m.skiplist().lookup(key) {
                        if node.key == key {
                            return read_mem_node(node);
                        }
                    }
                }
                Table::Pmem(p) => {
                    first_pmem = Some(p);
                    break;
                }
            }
        }

        if let Some(ht) = db.hash_cache(shard) {
            if let Some(word) = ht.get(key) {
                let node = unsafe { PmNode::from_ptr(PmPtr::from_word(word)) }?;
                return read_pm_node(node);
            }
        }

        self.pmem_get_cnt += 1;
        let pool_id = self.logs[shard].pool_id();

        let mut pending = first_pmem;
        loop {
            let table = match pending.take() {
                Some(p) => p,
                None => match iter.next() {
                    Some(Table::Pmem(p)) => p,
                    Some(Table::Mem(_)) => continue,
                    None => break,
                },
            };
            match self.lookup_l0(key, pool_id, table.skiplist(), 0) {
                L0Search::Hit(found) => {
                    if let Some(node) = unsafe { PmNode::from_ptr(found) } {
                        if node.key == key {
                            return read_pm_node(node);
                        }
                    }
                }
                L0Search::Promoted => {
                    trace!(key = %key, "L1 node met in L0 search; trying next table");
                }
            }
        }

        for table in db.table_list(1, shard).iter(&guard) {
            if let Some(p) = table.as_pmem() {
                let found = self.lookup_l1(key, pool_id, p.skiplist(), shard);
                if let Some(node) = unsafe { PmNode::from_ptr(found) } {
                    if node.key == key {
                        return read_pm_node(node);
                    }
                }
            }
        }

        None
    }

    /// L0 table search with the level-tag early-skip: visited nodes are
    /// sampled every `level_check_period`-th probe, and a node promoted
    /// past `table_level` aborts the search in favor of the next table.
    fn lookup_l0(
        &mut self,
        key: Key,
        pool_id: u16,
        sl: &BraidedSkipList,
        table_level: usize,
    ) -> L0Search {
        let period = self.db.options().level_check_period;
        let mut pred = sl.head(pool_id) as *const PmNode;
        self.search_visit_cnt += 1;
        self.height_visit_cnt[MAX_HEIGHT - 1] += 1;
        let height = unsafe { (*pred).height() };

        for i in (1..height).rev() {
            loop {
                let word = unsafe { (*pred).next(i).load(Ordering::Acquire) };
                if let Some(curr) = unsafe { PmNode::from_ptr(PmPtr::from_word(word)) } {
                    self.search_visit_cnt += 1;
                    self.height_visit_cnt[i] += 1;
                    if self.rng.next_u32() % period == 0 && curr.tag().level() > table_level {
                        return L0Search::Promoted;
                    }
                    if curr.key < key {
                        pred = curr as *const PmNode;
                        continue;
                    }
                }
                break;
            }
        }

        if std::ptr::eq(pred, sl.head(pool_id)) {
            if pool_id != sl.primary_pool() {
                self.search_visit_cnt += 1;
                self.height_visit_cnt[MAX_HEIGHT - 1] += 1;
            }
            pred = sl.head(sl.primary_pool()) as *const PmNode;
        }
        let mut word;
        loop {
            word = unsafe { (*pred).next(0).load(Ordering::Acquire) };
            if let Some(curr) = unsafe { PmNode::from_ptr(PmPtr::from_word(word)) } {
                self.search_visit_cnt += 1;
                self.height_visit_cnt[0] += 1;
                if self.rng.next_u32() % period == 0 && curr.tag().level() > table_level {
                    return L0Search::Promoted;
                }
                if curr.key < key {
                    pred = curr as *const PmNode;
                    continue;
                }
            }
            break;
        }
        L0Search::Hit(PmPtr::from_word(word))
    }

    /// L1 search seeded by the shard's LRU predecessor cache: any cached
    /// node below the probe key is a legal starting point and saves the
    /// upper-layer descent from the head.
    fn lookup_l1(&mut self, key: Key, pool_id: u16, sl: &BraidedSkipList, shard: usize) -> PmPtr {
        let mut pred = sl.head(pool_id) as *const PmNode;
        let hint = self.db.lru_cache(shard, self.region).find_less_than(key);
        if hint != 0 {
            if let Some(node) = unsafe { PmNode::from_ptr(PmPtr::from_word(hint)) } {
                pred = node as *const PmNode;
            }
        }
        let height = unsafe { (*pred).height() };
        self.search_visit_cnt += 1;
        self.height_visit_cnt[height - 1] += 1;

        for i in (1..height).rev() {
            loop {
                let word = unsafe { (*pred).next(i).load(Ordering::Acquire) };
                if let Some(curr) = unsafe { PmNode::from_ptr(PmPtr::from_word(word)) } {
                    self.search_visit_cnt += 1;
                    self.height_visit_cnt[i] += 1;
                    if curr.key < key {
                        pred = curr as *const PmNode;
                        continue;
                    }
                }
                break;
            }
        }

        if std::ptr::eq(pred, sl.head(pool_id)) {
            if pool_id != sl.primary_pool() {
                self.search_visit_cnt += 1;
                self.height_visit_cnt[MAX_HEIGHT - 1] += 1;
            }
            pred = sl.head(sl.primary_pool()) as *const PmNode;
        }
        let mut word;
        loop {
            word = unsafe { (*pred).next(0).load(Ordering::Acquire) };
            if let Some(curr) = unsafe { PmNode::from_ptr(PmPtr::from_word(word)) } {
                self.search_visit_cnt += 1;
                self.height_visit_cnt[0] += 1;
                if curr.key < key {
                    pred = curr as *const PmNode;
                    continue;
                }
            }
            break;
        }
        PmPtr::from_word(word)
    }

    /// Geometric height, scaled so per-region upper-layer density stays
    /// at the non-braided level: the first promotion fires with
    /// probability `1 / max(1, BRANCHING / num_regions)`, later ones
    /// with `1 / BRANCHING`.
    fn random_height(&mut self) -> usize {
        let first = (BRANCHING / self.db.num_regions() as u32).max(1);
        let mut height = 1;
        if self.rng.next_u32() % first == 0 {
            height += 1;
            while height < MAX_HEIGHT && self.rng.next_u32() % BRANCHING == 0 {
                height += 1;
            }
        }
        height
    }
}

fn read_mem_node(node: &MemNode) -> Option<Value> {
    match node.op() {
        OpType::Deletion => None,
        _ => {
            let record = unsafe { PmNode::from_ptr(PmPtr::from_word(node.value)) }?;
            Some(record.value)
        }
    }
}

fn read_pm_node(node: &PmNode) -> Option<Value> {
    match node.tag().op() {
        OpType::Deletion => None,
        _ => Some(node.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Options;

    fn test_db(opts: Options) -> Arc<Db> {
        Arc::new(Db::volatile(opts).unwrap())
    }

    fn small_opts() -> Options {
        Options {
            num_regions: 2,
            num_shards: 4,
            memtable_capacity: 1 << 20,
            max_memtables: 4,
            pool_size: 1 << 22,
            ..Options::default()
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let db = test_db(small_opts());
        let mut client = Client::new(Arc::clone(&db), 1, 0);
        for k in 1u64..=100 {
            client.put(Key::new(k), k * 7).unwrap();
        }
        for k in 1u64..=100 {
            assert_eq!(client.get(Key::new(k)), Some(k * 7));
        }
        assert_eq!(client.get(Key::new(101)), None);
    }

    #[test]
    fn test_overwrite_newest_wins() {
        let db = test_db(small_opts());
        let mut client = Client::new(db, 2, 0);
        client.put(Key::new(9), 1).unwrap();
        assert_eq!(client.get(Key::new(9)), Some(1));
        client.put(Key::new(9), 2).unwrap();
        assert_eq!(client.get(Key::new(9)), Some(2));
    }

    #[test]
    fn test_delete_shadows_value() {
        let db = test_db(small_opts());
        let mut client = Client::new(db, 3, 0);
        client.put(Key::new(5), 50).unwrap();
        client.delete(Key::new(5)).unwrap();
        assert_eq!(client.get(Key::new(5)), None);
        client.put(Key::new(5), 51).unwrap();
        assert_eq!(client.get(Key::new(5)), Some(51));
    }

    #[test]
    fn test_zero_key_rejected() {
        let db = test_db(small_opts());
        let mut client = Client::new(db, 4, 0);
        assert!(matches!(
            client.put(Key::ZERO, 1),
            Err(KvError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_cross_region_visibility() {
        let db = test_db(small_opts());
        let mut writer = Client::new(Arc::clone(&db), 5, 0);
        let mut reader = Client::new(db, 6, 1);
        for k in 1u64..=50 {
            writer.put(Key::new(k), k).unwrap();
        }
        for k in 1u64..=50 {
            assert_eq!(reader.get(Key::new(k)), Some(k));
        }
    }

    #[test]
    fn test_reads_after_flush_and_compaction() {
        let db = test_db(small_opts());
        let mut client = Client::new(Arc::clone(&db), 7, 0);
        for k in 1u64..=200 {
            client.put(Key::new(k), k + 1000).unwrap();
        }
        for s in 0..db.num_shards() {
            db.flush_shard(s).unwrap();
            db.compact_shard(s).unwrap();
        }
        let mut reader = Client::new(db, 8, 1);
        for k in 1u64..=200 {
            assert_eq!(reader.get(Key::new(k)), Some(k + 1000), "key {}", k);
        }
        assert!(reader.pmem_get_count() > 0);
    }

    #[test]
    fn test_group_logging_visibility_at_batch_boundary() {
        let opts = Options {
            group_logging: 8,
            num_shards: 1,
            ..small_opts()
        };
        let db = test_db(opts);
        let mut writer = Client::new(Arc::clone(&db), 9, 0);
        let mut reader = Client::new(db, 10, 0);

        for k in 1u64..=7 {
            writer.put(Key::new(k), k).unwrap();
        }
        // Seven records are buffered, none installed yet.
        assert_eq!(reader.get(Key::new(1)), None);

        writer.put(Key::new(8), 8).unwrap();
        for k in 1u64..=8 {
            assert_eq!(reader.get(Key::new(k)), Some(k));
        }

        writer.put(Key::new(9), 9).unwrap();
        assert_eq!(reader.get(Key::new(9)), None);
        writer.flush_batches().unwrap();
        assert_eq!(reader.get(Key::new(9)), Some(9));
    }

    #[test]
    fn test_height_distribution_scales_with_regions() {
        let draws = 100_000;

        // Two regions: the first promotion is certain, the second is a
        // coin flip.
        let db = test_db(small_opts());
        let mut client = Client::new(db, 11, 0);
        let mut at_least = [0u64; 4];
        for _ in 0..draws {
            let h = client.random_height();
            for (i, slot) in at_least.iter_mut().enumerate() {
                if h >= i + 1 {
                    *slot += 1;
                }
            }
        }
        assert_eq!(at_least[1], draws, "h >= 2 must always hold with 2 regions");
        let frac3 = at_least[2] as f64 / draws as f64;
        assert!((frac3 - 0.5).abs() < 0.05, "h >= 3 fraction {}", frac3);

        // One region: plain geometric with p = 1/2.
        let db = test_db(Options {
            num_regions: 1,
            ..small_opts()
        });
        let mut client = Client::new(db, 12, 0);
        let mut ge2 = 0u64;
        for _ in 0..draws {
            if client.random_height() >= 2 {
                ge2 += 1;
            }
        }
        let frac2 = ge2 as f64 / draws as f64;
        assert!((frac2 - 0.5).abs() < 0.05, "h >= 2 fraction {}", frac2);
    }

    #[test]
    fn test_l1_hint_reduces_visits() {
        let opts = Options {
            num_shards: 1,
            ..small_opts()
        };
        let db = test_db(opts);
        let mut writer = Client::new(Arc::clone(&db), 20, 0);
        for k in 1u64..=500 {
            writer.put(Key::new(k), k).unwrap();
        }
        db.flush_shard(0).unwrap();
        db.compact_shard(0).unwrap();

        let probe = Key::new(400);

        // Region 1's hint cache saw no compaction traffic (all records
        // live in region 0 pools), so this read pays the full descent.
        let mut cold = Client::new(Arc::clone(&db), 21, 1);
        assert_eq!(cold.get(probe), Some(400));
        let cold_visits = cold.search_visit_count();

        // Warm the cache with a true predecessor taken from the L1 list.
        let guard = epoch::pin();
        let l1 = db
            .table_list(1, 0)
            .front(&guard)
            .and_then(|t| t.as_pmem())
            .unwrap();
        let pred_key = Key::new(399);
        let pred = l1.skiplist().lookup(pred_key, db.log(1, 0).pool_id());
        let pred_node = unsafe { PmNode::from_ptr(pred) }.unwrap();
        assert_eq!(pred_node.key, pred_key);
        db.lru_cache(0, 1).insert(pred_key, pred.word());

        let mut warm = Client::new(db, 22, 1);
        assert_eq!(warm.get(probe), Some(400));
        assert!(
            warm.search_visit_count() <= cold_visits,
            "hinted search visited {} nodes, unhinted {}",
            warm.search_visit_count(),
            cold_visits
        );
    }

    #[test]
    fn test_lookup_stats_accumulate() {
        let db = test_db(small_opts());
        let mut client = Client::new(Arc::clone(&db), 13, 0);
        for k in 1u64..=64 {
            client.put(Key::new(k), k).unwrap();
        }
        for s in 0..db.num_shards() {
            db.flush_shard(s).unwrap();
        }
        assert_eq!(client.search_visit_count(), 0);
        for k in 1u64..=64 {
            client.get(Key::new(k));
        }
        assert_eq!(client.pmem_get_count(), 64);
        assert!(client.search_visit_count() >= 64);
        assert!(client.height_visit_count(MAX_HEIGHT - 1) >= 64);
    }
}
