// PM log: a bump allocator over one pool, producing monotonically
// increasing tagged pointers. One log exists per (region, shard) pair;
// the shard-affine client is the single fast-path producer, but the tail
// is advanced atomically so compactors can allocate concurrently.

use super::pool::{Pool, POOL_DATA_START};
use super::ptr::PmPtr;
use crate::error::{KvError, Result};
use crate::util::align8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct PmemLog {
    pool: Arc<Pool>,
    tail: AtomicU64,
}

impl PmemLog {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            tail: AtomicU64::new(POOL_DATA_START),
            pool,
        }
    }

    /// Builds a log over a reopened pool whose valid prefix ends at
    /// `tail` (as decided by the recovery scan).
    pub fn recovered(pool: Arc<Pool>, tail: u64) -> Self {
        Self {
            tail: AtomicU64::new(tail.max(POOL_DATA_START)),
            pool,
        }
    }

    /// Allocates `size` bytes, 8-byte aligned, and returns their tagged
    /// pointer. Multi-producer safe.
    pub fn allocate(&self, size: usize) -> Result<PmPtr> {
        let size = align8(size) as u64;
        let offset = self.tail.fetch_add(size, Ordering::Relaxed);
        if offset + size > self.pool.len() as u64 {
            // The tail stays past the end; every later allocation fails
            // the same way. Arena exhaustion is terminal for the pool.
            return Err(KvError::Full(format!(
                "pm log in pool {} exhausted",
                self.pool.id()
            )));
        }
        Ok(PmPtr::new(self.pool.id(), offset))
    }

    /// Flushes the record at `ptr` to the persistence domain.
    pub fn persist(&self, ptr: PmPtr, len: usize) {
        persist_range(ptr.resolve(), len);
    }

    pub fn pool_id(&self) -> u16 {
        self.pool.id()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    /// Records the current tail in the pool header (advisory).
    pub fn sync_tail_hint(&self) {
        self.pool.set_tail_hint(self.tail());
    }
}

/// Cache-line writeback of `[ptr, ptr+len)` followed by a store fence.
/// After this returns, a power loss followed by replay observes the
/// entire range.
#[inline]
pub fn persist_range(ptr: *const u8, len: usize) {
    if ptr.is_null() || len == 0 {
        return;
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_clflush, _mm_sfence};
        let start = ptr as usize & !63;
        let end = ptr as usize + len;
        let mut line = start;
        while line < end {
            _mm_clflush(line as *const u8);
            line += 64;
        }
        _mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// Store fence alone, for ordering two plain stores to the same record.
#[inline]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(Ordering::SeqCst);
}
