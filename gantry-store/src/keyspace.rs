use crate::{StorageHandler, StoreError};
use async_trait::async_trait;
use std::sync::Arc;

/// View over a store that prefixes every key, isolating a keyspace.
///
/// Per-API cache stores are keyspace views named `cache-<api_id>` over the
/// shared cache backend.
pub struct KeyspaceStore {
    inner: Arc<dyn StorageHandler>,
    prefix: String,
}

impl KeyspaceStore {
    pub fn new(inner: Arc<dyn StorageHandler>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl StorageHandler for KeyspaceStore {
    async fn get_key(&self, key: &str) -> Result<String, StoreError> {
        self.inner.get_key(&self.full(key)).await
    }

    async fn set_key(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        self.inner.set_key(&self.full(key), value, ttl_secs).await
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_key(&self.full(key)).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let full = self.full(prefix);
        let stripped = format!("{}:", self.prefix);
        Ok(self
            .inner
            .keys(&full)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&stripped).map(|s| s.to_string()))
            .collect())
    }
}
