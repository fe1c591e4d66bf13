use std::sync::Arc;

use tracing::info;

use crate::{
    config::Config,
    notifier::Notifier,
    store::{MemoryStore, RecordStore, SqliteStore, StoreError},
};

/// Shared handler state. Everything request handlers touch is reached
/// through here; there are no process-wide singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub notifier: Notifier,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn RecordStore>) -> Self {
        let notifier = Notifier::new(config.subscriber_buffer);
        Self {
            config: Arc::new(config),
            store,
            notifier,
        }
    }

    /// Open the configured store: SQLite when a database path is set,
    /// otherwise the in-memory fallback.
    pub fn from_config(config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn RecordStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        info!(store = store.kind(), "record store ready");

        Ok(Self::new(config, store))
    }
}
