// Persistent-memory plumbing: pool files and their process-wide base
// registry, the (pool_id, offset) tagged pointer, and the bump-allocated
// log arena that produces them.

pub mod log;
pub mod pool;
pub mod ptr;

pub use log::{persist_range, sfence, PmemLog};
pub use pool::{Pool, POOL_DATA_START};
pub use ptr::PmPtr;
