use crate::{ContextStore, Result, WorkQueueStore};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Configuration for the relay database
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub max_history_messages: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./data"),
            max_history_messages: 40,
        }
    }
}

/// Column family names
pub(crate) const CF_ITEMS: &str = "items";
pub(crate) const CF_BY_SEQ: &str = "by_seq";
pub(crate) const CF_PENDING: &str = "pending";
pub(crate) const CF_PENDING_BY_CHAT: &str = "pending_by_chat";
pub(crate) const CF_PROCESSING: &str = "processing";
pub(crate) const CF_META: &str = "meta";
pub(crate) const CF_CHAT_CONTEXT: &str = "chat_context";

pub(crate) const COLUMN_FAMILIES: [&str; 7] = [
    CF_ITEMS,
    CF_BY_SEQ,
    CF_PENDING,
    CF_PENDING_BY_CHAT,
    CF_PROCESSING,
    CF_META,
    CF_CHAT_CONTEXT,
];

/// Both stores, sharing one RocksDB instance
pub struct Storage {
    pub queue: Arc<WorkQueueStore>,
    pub context: Arc<ContextStore>,
}

impl Storage {
    /// Open or create the database, creating any missing column families
    pub fn open(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, config.data_dir.join("relay"), cf_descriptors)?;

        info!("Opened relay store at {:?}", config.data_dir);
        Self::from_db(Arc::new(db), &config)
    }

    /// Open without taking the write lock, for inspection next to a running relay
    pub fn open_read_only(config: StorageConfig) -> Result<Self> {
        let db = DB::open_cf_for_read_only(
            &Options::default(),
            config.data_dir.join("relay"),
            COLUMN_FAMILIES,
            false,
        )?;

        Self::from_db(Arc::new(db), &config)
    }

    fn from_db(db: Arc<DB>, config: &StorageConfig) -> Result<Self> {
        let queue = WorkQueueStore::new(db.clone())?;
        let context = ContextStore::new(db, config.max_history_messages);

        Ok(Storage {
            queue: Arc::new(queue),
            context: Arc::new(context),
        })
    }
}
