// Table hierarchy: volatile MemTables, persistent PmemTables, and the
// newest-first per-(level, shard) table list that orders them.

pub mod list;
pub mod memtable;
pub mod pmemtable;

pub use list::{Table, TableList};
pub use memtable::{MemTable, TableState, WritableMem};
pub use pmemtable::PmemTable;
