use crate::{StorageHandler, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Clone)]
struct Entry {
    value: String,
    /// Unix expiry timestamp; None = no expiry.
    expires_at: Option<i64>,
}

/// DashMap-backed store for tests and single-node defaults.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<String> {
        let now = chrono::Utc::now().timestamp();
        let (value, expired) = match self.entries.get(key) {
            Some(e) => (
                Some(e.value.clone()),
                e.expires_at.is_some_and(|t| t <= now),
            ),
            None => (None, false),
        };
        if expired {
            // The read guard is released before the removal.
            self.entries.remove(key);
            return None;
        }
        value
    }
}

#[async_trait]
impl StorageHandler for InMemoryStore {
    async fn get_key(&self, key: &str) -> Result<String, StoreError> {
        self.live(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    async fn set_key(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let expires_at = (ttl_secs > 0).then(|| chrono::Utc::now().timestamp() + ttl_secs);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .filter(|e| e.expires_at.is_none_or(|t| t > now))
            .map(|e| e.key().clone())
            .collect())
    }
}
