use crate::keyspace::KeyspaceStore;
use crate::ldap::{DirectoryBackend, LdapKeyStore, LdapMeta};
use crate::StorageHandler;
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::ApiDescriptor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// The bundle of ambient stores the loader initialises once per reload.
#[derive(Clone)]
pub struct AmbientStores {
    pub default_store: Arc<dyn StorageHandler>,
    pub org_store: Arc<dyn StorageHandler>,
    pub health_store: Arc<dyn StorageHandler>,
    pub rpc_store: Option<Arc<dyn StorageHandler>>,
    pub rpc_org_store: Option<Arc<dyn StorageHandler>>,
    /// Per-API cache stores are keyspace views over this backend.
    pub cache_backend: Arc<dyn StorageHandler>,
    pub directory: Option<Arc<dyn DirectoryBackend>>,
}

impl AmbientStores {
    /// Everything on one in-memory backend. Test and single-node default.
    pub fn in_memory() -> Self {
        let store: Arc<dyn StorageHandler> = Arc::new(crate::memory::InMemoryStore::new());
        Self {
            default_store: store.clone(),
            org_store: store.clone(),
            health_store: store.clone(),
            rpc_store: None,
            rpc_org_store: None,
            cache_backend: store,
            directory: None,
        }
    }
}

/// Process-wide flags flipped as a side effect of store binding.
#[derive(Default)]
pub struct RuntimeFlags {
    pub enforce_org_data_age: AtomicBool,
}

/// Stores selected for one API's chain.
#[derive(Clone)]
pub struct BoundStores {
    pub auth: Arc<dyn StorageHandler>,
    pub org: Arc<dyn StorageHandler>,
    pub session: Arc<dyn StorageHandler>,
    pub health: Arc<dyn StorageHandler>,
    pub cache: Arc<dyn StorageHandler>,
}

/// Select per-API stores from the ambient bundle.
pub fn bind_stores(
    spec: &ApiDescriptor,
    ambient: &AmbientStores,
    config: &GatewayConfig,
    flags: &RuntimeFlags,
) -> BoundStores {
    let rpc_mode = config.slave_options.use_rpc;
    let mut rpc_selected = false;

    let auth: Arc<dyn StorageHandler> = match spec.auth_provider.storage_engine.as_str() {
        "ldap" => match (&ambient.directory, LdapMeta::from_meta(&spec.auth_provider.meta)) {
            (Some(backend), Ok(meta)) => Arc::new(LdapKeyStore::new(meta, backend.clone())),
            (None, _) => {
                warn!(api_id = %spec.api_id, "LDAP auth provider declared but no directory backend configured; using default store");
                ambient.default_store.clone()
            }
            (_, Err(e)) => {
                warn!(api_id = %spec.api_id, error = %e, "LDAP auth provider meta rejected; using default store");
                ambient.default_store.clone()
            }
        },
        "rpc" => {
            rpc_selected = true;
            rpc_keyed(ambient)
        }
        _ if rpc_mode => {
            rpc_selected = true;
            rpc_keyed(ambient)
        }
        _ => ambient.default_store.clone(),
    };

    let session: Arc<dyn StorageHandler> =
        if spec.session_provider.storage_engine == "rpc" || rpc_mode {
            rpc_selected = true;
            rpc_keyed(ambient)
        } else {
            ambient.default_store.clone()
        };

    let org: Arc<dyn StorageHandler> = if rpc_mode {
        ambient
            .rpc_org_store
            .clone()
            .unwrap_or_else(|| ambient.org_store.clone())
    } else {
        ambient.org_store.clone()
    };

    if rpc_selected {
        flags.enforce_org_data_age.store(true, Ordering::Relaxed);
    }

    BoundStores {
        auth,
        org,
        session,
        health: ambient.health_store.clone(),
        cache: Arc::new(KeyspaceStore::new(
            ambient.cache_backend.clone(),
            format!("cache-{}", spec.api_id),
        )),
    }
}

fn rpc_keyed(ambient: &AmbientStores) -> Arc<dyn StorageHandler> {
    ambient
        .rpc_store
        .clone()
        .unwrap_or_else(|| ambient.default_store.clone())
}
