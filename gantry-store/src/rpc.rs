use crate::{StorageHandler, StoreError};
use async_trait::async_trait;
use std::sync::Arc;

/// Transport contract for the RPC backbone used in slave mode. The concrete
/// client is an external collaborator.
#[async_trait]
pub trait RpcDriver: Send + Sync {
    async fn get(&self, keyspace: &str, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(
        &self,
        keyspace: &str,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<(), StoreError>;
    async fn delete(&self, keyspace: &str, key: &str) -> Result<(), StoreError>;
    async fn list(&self, keyspace: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Store handle backed by the RPC driver.
pub struct RpcStore {
    driver: Arc<dyn RpcDriver>,
    keyspace: String,
}

impl RpcStore {
    pub fn new(driver: Arc<dyn RpcDriver>, keyspace: impl Into<String>) -> Self {
        Self {
            driver,
            keyspace: keyspace.into(),
        }
    }
}

#[async_trait]
impl StorageHandler for RpcStore {
    async fn get_key(&self, key: &str) -> Result<String, StoreError> {
        self.driver
            .get(&self.keyspace, key)
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    async fn set_key(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        self.driver.put(&self.keyspace, key, value, ttl_secs).await
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.driver.delete(&self.keyspace, key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.driver.list(&self.keyspace, prefix).await
    }
}
