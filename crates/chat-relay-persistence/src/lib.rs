mod db;
mod keys;
mod store;
mod context;

pub use db::{Storage, StorageConfig};
pub use store::{WorkQueueStore, QueueStats};
pub use context::ContextStore;

use chat_relay_core::{ItemId, RelayError, SourceSeq};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Work item error: {0}")]
    ItemError(#[from] RelayError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Source sequence already enqueued: {0}")]
    DuplicateSourceSeq(SourceSeq),

    #[error("Work item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Lease on item {id} (epoch {epoch}) is no longer held")]
    StaleLease { id: ItemId, epoch: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    /// Errors worth retrying: the storage engine or filesystem hiccuped.
    /// Everything else is a statement about the data and will not change.
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::RocksDbError(_) | PersistenceError::IoError(_))
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
