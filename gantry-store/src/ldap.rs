use crate::{StorageHandler, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Directory lookup contract. The LDAP client proper is an external
/// collaborator; the adapter only shapes keys into DN/attribute queries.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    async fn lookup(&self, dn: &str, attribute: &str) -> Result<Option<String>, StoreError>;
}

/// Connection shape carried in a descriptor's auth-provider metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct LdapMeta {
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_ldap_port")]
    pub port: u16,

    #[serde(default)]
    pub base_dn: String,

    /// Template with `{key}` substituted by the looked-up credential id.
    #[serde(default = "default_dn_template")]
    pub dn_template: String,

    #[serde(default = "default_session_attribute")]
    pub session_attribute: String,
}

fn default_ldap_port() -> u16 {
    389
}

fn default_dn_template() -> String {
    "cn={key}".to_string()
}

fn default_session_attribute() -> String {
    "tokenSession".to_string()
}

impl LdapMeta {
    pub fn from_meta(meta: &serde_json::Value) -> Result<Self, StoreError> {
        serde_json::from_value(meta.clone())
            .map_err(|e| StoreError::Backend(format!("bad LDAP provider meta: {}", e)))
    }

    fn dn_for(&self, key: &str) -> String {
        let rdn = self.dn_template.replace("{key}", key);
        if self.base_dn.is_empty() {
            rdn
        } else {
            format!("{},{}", rdn, self.base_dn)
        }
    }
}

/// Auth store adapter built from a descriptor's auth-provider metadata.
pub struct LdapKeyStore {
    meta: LdapMeta,
    backend: Arc<dyn DirectoryBackend>,
}

impl LdapKeyStore {
    pub fn new(meta: LdapMeta, backend: Arc<dyn DirectoryBackend>) -> Self {
        Self { meta, backend }
    }
}

#[async_trait]
impl StorageHandler for LdapKeyStore {
    async fn get_key(&self, key: &str) -> Result<String, StoreError> {
        let dn = self.meta.dn_for(key);
        self.backend
            .lookup(&dn, &self.meta.session_attribute)
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    async fn set_key(&self, _key: &str, _value: &str, _ttl: i64) -> Result<(), StoreError> {
        Err(StoreError::Backend("LDAP auth store is read-only".into()))
    }

    async fn delete_key(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("LDAP auth store is read-only".into()))
    }

    async fn keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Backend("LDAP auth store is not enumerable".into()))
    }
}
