// Log replay for reopened pools.
//
// Records are self-describing: a record is committed iff its key is
// non-zero and its height nibble is in range. The key is the commit
// marker (it is stored after tag and value behind a fence), so a torn
// append shows up as a zero key with a plausible tag and is skipped.
// Height decides the record size; when the height itself is invalid the
// scan cannot advance and stops, which also terminates cleanly on the
// zeroed space past the last append.

use crate::index::braided::{OpType, PmNode, MAX_HEIGHT};
use crate::pmem::{PmPtr, Pool, POOL_DATA_START};
use crate::util::align8;
use tracing::{debug, warn};

pub struct RecoveredRecord {
    pub seq: u64,
    pub ptr: PmPtr,
}

/// Scans one pool's log and returns the committed records plus the
/// offset where appends may resume.
pub fn scan_log(pool: &Pool) -> (Vec<RecoveredRecord>, u64) {
    let mut records = Vec::new();
    let mut offset = POOL_DATA_START;
    let len = pool.len() as u64;
    let header_len = std::mem::size_of::<PmNode>() as u64;

    while offset + header_len <= len {
        let p = unsafe { pool.base().add(offset as usize) } as *const PmNode;
        let key = unsafe { std::ptr::addr_of!((*p).key).read() };
        let tag = unsafe { (*p).tag() };

        let height = tag.height();
        if height == 0 || height > MAX_HEIGHT {
            // Unwritten space or an undecidable record; either way the
            // scan cannot size it.
            break;
        }
        let size = align8(PmNode::alloc_size(height)) as u64;
        if offset + size > len {
            break;
        }

        if key.is_zero() {
            if tag.op() != OpType::Anchor {
                warn!(
                    pool_id = pool.id(),
                    offset, "skipping torn record during recovery"
                );
            }
            offset += size;
            continue;
        }

        records.push(RecoveredRecord {
            seq: tag.seq(),
            ptr: PmPtr::new(pool.id(), offset),
        });
        offset += size;
    }

    debug!(
        pool_id = pool.id(),
        records = records.len(),
        tail = offset,
        "log scan complete"
    );
    (records, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::braided::Tag;
    use crate::pmem::{PmemLog, Pool};
    use crate::Key;
    use std::sync::Arc;

    fn append(log: &PmemLog, key: u64, seq: u64, height: usize) -> PmPtr {
        let ptr = log.allocate(PmNode::alloc_size(height)).unwrap();
        unsafe {
            PmNode::write_record(
                ptr.resolve() as *mut PmNode,
                Key::new(key),
                Tag::new(seq, OpType::Value, height),
                key * 2,
            );
        }
        ptr
    }

    #[test]
    fn test_scan_returns_committed_records() {
        let pool = Arc::new(Pool::anonymous(1 << 16).unwrap());
        let log = PmemLog::new(Arc::clone(&pool));
        for (i, k) in [4u64, 9, 2].iter().enumerate() {
            append(&log, *k, i as u64, 1 + (i % 3));
        }

        let (records, tail) = scan_log(&pool);
        assert_eq!(records.len(), 3);
        assert_eq!(tail, log.tail());
        let keys: Vec<u64> = records
            .iter()
            .map(|r| unsafe { PmNode::from_ptr(r.ptr) }.unwrap().key.get())
            .collect();
        assert_eq!(keys, vec![4, 9, 2]);
    }

    #[test]
    fn test_scan_skips_torn_record() {
        let pool = Arc::new(Pool::anonymous(1 << 16).unwrap());
        let log = PmemLog::new(Arc::clone(&pool));
        append(&log, 1, 0, 2);
        // Simulate a crash between the tag/value persist and the key
        // store: tag and value are durable, the key never landed.
        let torn = log.allocate(PmNode::alloc_size(3)).unwrap();
        unsafe {
            let p = torn.resolve() as *mut PmNode;
            (*p).set_tag(Tag::new(1, OpType::Value, 3));
            std::ptr::addr_of_mut!((*p).value).write(999);
        }
        append(&log, 3, 2, 1);

        let (records, _) = scan_log(&pool);
        let keys: Vec<u64> = records
            .iter()
            .map(|r| unsafe { PmNode::from_ptr(r.ptr) }.unwrap().key.get())
            .collect();
        assert_eq!(keys, vec![1, 3], "earlier and later records survive");
    }

    #[test]
    fn test_scan_stops_at_undecidable_height() {
        let pool = Arc::new(Pool::anonymous(1 << 16).unwrap());
        let log = PmemLog::new(Arc::clone(&pool));
        append(&log, 1, 0, 2);
        let bad = log.allocate(PmNode::alloc_size(1)).unwrap();
        unsafe {
            let p = bad.resolve() as *mut PmNode;
            std::ptr::addr_of_mut!((*p).key).write(Key::new(7));
            // height nibble 0: the record size is undecidable
            (*p).set_tag(Tag::from_word(0x70));
        }
        append(&log, 9, 2, 1);

        let (records, tail) = scan_log(&pool);
        assert_eq!(records.len(), 1);
        assert_eq!(tail, bad.offset());
    }

    #[test]
    fn test_scan_ignores_head_sentinels() {
        let pool = Arc::new(Pool::anonymous(1 << 16).unwrap());
        let log = PmemLog::new(Arc::clone(&pool));
        // A skip-list head: zero key, Anchor op, full height.
        let head = log.allocate(PmNode::alloc_size(MAX_HEIGHT)).unwrap();
        unsafe {
            (head.resolve() as *mut PmNode as *mut u8).write_bytes(0, PmNode::alloc_size(MAX_HEIGHT));
            (*(head.resolve() as *mut PmNode)).set_tag(Tag::new(0, OpType::Anchor, MAX_HEIGHT));
        }
        append(&log, 5, 1, 2);

        let (records, _) = scan_log(&pool);
        assert_eq!(records.len(), 1);
        assert_eq!(
            unsafe { PmNode::from_ptr(records[0].ptr) }.unwrap().key.get(),
            5
        );
    }
}
