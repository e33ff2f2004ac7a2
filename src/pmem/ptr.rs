// Tagged persistent pointer: the only form in which inter-node links are
// stored on persistent memory. Offsets survive remapping; raw addresses
// would not.

use super::pool;

/// 64-bit tagged pointer packing `(pool_id << 48) | offset`.
///
/// The all-zero word is the null pointer; offset 0 of every pool is
/// occupied by the pool header, so no live record ever encodes as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PmPtr(u64);

impl PmPtr {
    pub const NULL: PmPtr = PmPtr(0);

    const OFFSET_MASK: u64 = (1 << 48) - 1;

    #[inline]
    pub const fn new(pool_id: u16, offset: u64) -> Self {
        PmPtr(((pool_id as u64) << 48) | (offset & Self::OFFSET_MASK))
    }

    #[inline]
    pub const fn from_word(word: u64) -> Self {
        PmPtr(word)
    }

    #[inline]
    pub const fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn pool_id(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Resolves to a live virtual address through the pool registry.
    ///
    /// Null for the zero word. A non-zero word naming an unregistered
    /// pool is a configuration fault: asserted in debug builds, null in
    /// release (callers already guard on null).
    #[inline]
    pub fn resolve(self) -> *mut u8 {
        if self.0 == 0 {
            return std::ptr::null_mut();
        }
        let base = pool::base(self.pool_id());
        debug_assert!(
            !base.is_null(),
            "resolve of PmPtr into unregistered pool {}",
            self.pool_id()
        );
        if base.is_null() {
            return std::ptr::null_mut();
        }
        unsafe { base.add(self.offset() as usize) }
    }

    /// Re-encodes a virtual address inside `pool_id` back into a tagged
    /// pointer.
    #[inline]
    pub fn from_va(pool_id: u16, va: *const u8) -> Self {
        let base = pool::base(pool_id);
        debug_assert!(!base.is_null());
        PmPtr::new(pool_id, va as u64 - base as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::pool::Pool;

    #[test]
    fn test_encode_decode() {
        let p = PmPtr::new(7, 0x1234_5678);
        assert_eq!(p.pool_id(), 7);
        assert_eq!(p.offset(), 0x1234_5678);
        assert_eq!(p, PmPtr::from_word(p.word()));
        assert!(!p.is_null());
        assert!(PmPtr::NULL.is_null());
    }

    #[test]
    fn test_resolve_round_trip() {
        let pool = Pool::anonymous(1 << 16).unwrap();
        let p = PmPtr::new(pool.id(), 128);
        assert_eq!(p.resolve(), unsafe { pool.base().add(128) });
        assert_eq!(PmPtr::from_va(pool.id(), p.resolve()), p);
    }

    #[test]
    fn test_null_resolves_to_null() {
        assert!(PmPtr::NULL.resolve().is_null());
    }
}
