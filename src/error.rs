use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arena or memtable pool exhausted.
    #[error("capacity exhausted: {0}")]
    Full(String),

    /// Recovery found a record whose size cannot be decided.
    #[error("corrupt record in pool {pool_id} at offset {offset}")]
    CorruptRecord { pool_id: u16, offset: u64 },

    /// A non-zero tagged pointer named a pool the registry does not know.
    #[error("pool {0} is not registered")]
    PoolNotRegistered(u16),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, KvError>;
