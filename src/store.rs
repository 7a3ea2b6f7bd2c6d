pub mod file_store;
pub mod memory_store;
pub mod postgres_store;
pub mod redis_store;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::app_error::SessionError;
use crate::error::store_error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use postgres_store::PostgresStore;
pub use redis_store::RedisStore;

/// Durable key/value storage that survives process restarts.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Builds the store adapter selected by `storage.backend`.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn PersistentStore>, SessionError> {
    let store: Arc<dyn PersistentStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(FileStore::open(&config.path).await?),
        StorageBackend::Redis => Arc::new(RedisStore::connect(&config.url).await?),
        StorageBackend::Postgres => Arc::new(PostgresStore::connect(&config.url, config.max_connections).await?),
    };
    info!(backend = ?config.backend, "persistent store opened");

    Ok(store)
}

/// Keys are used as file names and table keys, so they are restricted to a safe alphabet.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty() && key.len() <= 128 && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) && !key.starts_with('.');

    if valid { Ok(()) } else { Err(StoreError::InvalidKey(key.to_string())) }
}
