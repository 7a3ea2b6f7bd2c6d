use crate::error::store_error::StoreError;
use crate::store::{PersistentStore, validate_key};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Redis-backed store; the connection manager reconnects transparently after failures.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_prefix(url, "sentinel:").await
    }

    pub async fn connect_with_prefix(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::redis("Invalid Redis URL", e))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::redis("Failed to connect to Redis", e))?;

        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn namespaced(&self, key: &str) -> Result<String, StoreError> {
        namespaced_key(&self.prefix, key)
    }
}

fn namespaced_key(prefix: &str, key: &str) -> Result<String, StoreError> {
    validate_key(key)?;
    Ok(format!("{prefix}{key}"))
}

#[async_trait]
impl PersistentStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.namespaced(key)?;
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key = self.namespaced(key)?;
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = self.namespaced(key)?;
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
