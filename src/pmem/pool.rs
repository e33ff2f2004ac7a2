// Pool management for byte-addressable persistent memory.
//
// A pool is one contiguous mapped region backed either by a file (durable)
// or by an anonymous mapping (volatile, used by tests and benchmarks). The
// process-wide registry maps small integer pool ids to live base
// addresses; after open-time registration it is read lock-free on every
// tagged-pointer dereference.

use crate::error::{KvError, Result};
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::info;

/// Upper bound on simultaneously registered pools. The tagged-pointer
/// format allows 2^16 ids; the registry table stays small on purpose.
pub const MAX_POOLS: usize = 1024;

/// First usable byte of a pool; everything below is the pool header.
pub const POOL_DATA_START: u64 = 64;

const POOL_MAGIC: u64 = 0x6272_6169_646b_7631; // "braidkv1"

struct PoolRegistry {
    bases: Box<[AtomicUsize]>,
    next_id: AtomicU32,
}

static REGISTRY: Lazy<PoolRegistry> = Lazy::new(|| PoolRegistry {
    bases: (0..MAX_POOLS).map(|_| AtomicUsize::new(0)).collect(),
    next_id: AtomicU32::new(0),
});

/// Base virtual address for `pool_id`, or null if the pool is unknown.
/// Lock-free; safe to call from any thread after registration.
#[inline]
pub fn base(pool_id: u16) -> *mut u8 {
    if (pool_id as usize) < MAX_POOLS {
        REGISTRY.bases[pool_id as usize].load(Ordering::Acquire) as *mut u8
    } else {
        std::ptr::null_mut()
    }
}

fn allocate_id() -> Result<u16> {
    let id = REGISTRY.next_id.fetch_add(1, Ordering::Relaxed);
    if id as usize >= MAX_POOLS {
        return Err(KvError::Full("pool id space exhausted".into()));
    }
    Ok(id as u16)
}

/// Advances the id counter past `id` so a reopened pool never collides
/// with a later `allocate_id` call.
fn reserve_through(id: u16) {
    let floor = id as u32 + 1;
    let mut cur = REGISTRY.next_id.load(Ordering::Relaxed);
    while cur < floor {
        match REGISTRY.next_id.compare_exchange_weak(
            cur,
            floor,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

fn register(id: u16, base: *mut u8) -> Result<()> {
    let slot = &REGISTRY.bases[id as usize];
    if slot
        .compare_exchange(0, base as usize, Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        return Err(KvError::Configuration(format!(
            "pool {} is already registered",
            id
        )));
    }
    Ok(())
}

fn unregister(id: u16) {
    REGISTRY.bases[id as usize].store(0, Ordering::Release);
}

/// Fixed 64-byte header at offset 0 of every pool.
#[repr(C)]
struct PoolHeader {
    magic: u64,
    pool_id: u64,
    /// Advisory log tail; recovery rescans, this only shortens the scan.
    tail_hint: u64,
    _reserved: [u64; 5],
}

enum Backing {
    Anonymous,
    File { sync_on_drop: bool },
}

/// One contiguous region of (simulated) persistent memory with a
/// registered base address.
pub struct Pool {
    id: u16,
    base: *mut u8,
    len: usize,
    backing: Backing,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Creates a volatile pool backed by an anonymous mapping.
    pub fn anonymous(len: usize) -> Result<Pool> {
        let len = check_len(len)?;
        let id = allocate_id()?;
        let base = map_anonymous(len)?;
        let pool = Pool {
            id,
            base,
            len,
            backing: Backing::Anonymous,
        };
        pool.init_header();
        register(id, base)?;
        Ok(pool)
    }

    /// Creates a new durable pool file of `len` bytes and registers it
    /// under a freshly allocated pool id.
    pub fn create(path: &Path, len: usize) -> Result<Pool> {
        let len = check_len(len)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let id = allocate_id()?;
        let base = map_file(&file, len)?;
        let pool = Pool {
            id,
            base,
            len,
            backing: Backing::File { sync_on_drop: true },
        };
        pool.init_header();
        super::log::persist_range(base, std::mem::size_of::<PoolHeader>());
        register(id, base)?;
        info!(pool_id = id, path = %path.display(), len, "created pool");
        Ok(pool)
    }

    /// Re-opens an existing pool file, re-registering it under the pool
    /// id stored in its header.
    pub fn open(path: &Path) -> Result<Pool> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let len = check_len(len)?;
        let base = map_file(&file, len)?;
        let header = unsafe { &*(base as *const PoolHeader) };
        if header.magic != POOL_MAGIC {
            unmap(base, len);
            return Err(KvError::Configuration(format!(
                "{} is not a pool file",
                path.display()
            )));
        }
        let id = header.pool_id as u16;
        reserve_through(id);
        if let Err(e) = register(id, base) {
            unmap(base, len);
            return Err(e);
        }
        info!(pool_id = id, path = %path.display(), len, "opened pool");
        Ok(Pool {
            id,
            base,
            len,
            backing: Backing::File { sync_on_drop: true },
        })
    }

    fn init_header(&self) {
        let header = self.base as *mut PoolHeader;
        unsafe {
            (*header).magic = POOL_MAGIC;
            (*header).pool_id = self.id as u64;
            (*header).tail_hint = POOL_DATA_START;
            (*header)._reserved = [0; 5];
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Advisory tail stored at creation/open time; never trusted over a
    /// rescan.
    pub fn tail_hint(&self) -> u64 {
        unsafe { (*(self.base as *const PoolHeader)).tail_hint }
    }

    pub fn set_tail_hint(&self, tail: u64) {
        unsafe {
            (*(self.base as *mut PoolHeader)).tail_hint = tail;
        }
        super::log::persist_range(self.base, std::mem::size_of::<PoolHeader>());
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unregister(self.id);
        if let Backing::File { sync_on_drop: true } = &self.backing {
            sync_file(self.base, self.len);
        }
        unmap(self.base, self.len);
    }
}

fn check_len(len: usize) -> Result<usize> {
    if len <= POOL_DATA_START as usize {
        return Err(KvError::Configuration(format!(
            "pool size {} is below the header size",
            len
        )));
    }
    Ok(crate::util::align8(len))
}

#[cfg(unix)]
fn map_anonymous(len: usize) -> Result<*mut u8> {
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(KvError::Io(std::io::Error::last_os_error()));
    }
    Ok(p as *mut u8)
}

#[cfg(unix)]
fn map_file(file: &std::fs::File, len: usize) -> Result<*mut u8> {
    use std::os::unix::io::AsRawFd;
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(KvError::Io(std::io::Error::last_os_error()));
    }
    Ok(p as *mut u8)
}

#[cfg(unix)]
fn sync_file(base: *mut u8, len: usize) {
    unsafe {
        libc::msync(base as *mut libc::c_void, len, libc::MS_SYNC);
    }
}

#[cfg(unix)]
fn unmap(base: *mut u8, len: usize) {
    unsafe {
        libc::munmap(base as *mut libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn map_anonymous(len: usize) -> Result<*mut u8> {
    let layout = std::alloc::Layout::from_size_align(len, 4096)
        .map_err(|e| KvError::Configuration(e.to_string()))?;
    let p = unsafe { std::alloc::alloc_zeroed(layout) };
    if p.is_null() {
        return Err(KvError::Full("anonymous pool allocation failed".into()));
    }
    Ok(p)
}

#[cfg(not(unix))]
fn map_file(_file: &std::fs::File, _len: usize) -> Result<*mut u8> {
    Err(KvError::Configuration(
        "file-backed pools require a unix target".into(),
    ))
}

#[cfg(not(unix))]
fn sync_file(_base: *mut u8, _len: usize) {}

#[cfg(not(unix))]
fn unmap(base: *mut u8, len: usize) {
    let layout = std::alloc::Layout::from_size_align(len, 4096).unwrap();
    unsafe { std::alloc::dealloc(base, layout) };
}
