pub mod binder;
pub mod keyspace;
pub mod ldap;
pub mod memory;
pub mod rpc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Contract every credential/session/health/cache store satisfies.
///
/// Durable engines live behind this trait as external collaborators; the
/// in-memory implementation backs tests and single-node defaults.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    async fn get_key(&self, key: &str) -> Result<String, StoreError>;

    /// `ttl_secs <= 0` means no expiry.
    async fn set_key(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError>;

    async fn delete_key(&self, key: &str) -> Result<(), StoreError>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
