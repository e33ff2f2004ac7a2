// Skip-list index structures.
//
// `braided` is the persistent, NUMA-aware skip list shared by L0 and L1;
// `memsl` is the volatile skip list backing a MemTable. Both use the same
// key order and the same height distribution so a record's log entry can
// later serve as its persistent index node unchanged.

pub mod braided;
pub mod memsl;

pub use braided::{BraidedSkipList, OpType, PmNode, Tag, BRANCHING, MAX_HEIGHT};
pub use memsl::{MemNode, MemSkipList};
