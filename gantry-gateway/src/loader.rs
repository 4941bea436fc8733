use crate::arbiter::{arbitrate_listen_path, build_collision_map};
use crate::loopback::LoopEngine;
use crate::mux::{ListenKey, Resolution, RouterSet};
use arc_swap::ArcSwap;
use gantry_chain::chain::ApiChain;
use gantry_chain::composer::Composer;
use gantry_chain::options::ChainOption;
use gantry_chain::stages::custom::DriverHost;
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::{sort_descriptors, ApiDescriptor};
use gantry_core::KvResolver;
use gantry_store::binder::{bind_stores, AmbientStores, RuntimeFlags};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Collaborator notified when an API leaves the gateway.
pub trait UnloadHook: Send + Sync {
    fn api_unloaded(&self, spec: &ApiDescriptor);
}

/// Collaborator receiving TCP/TLS descriptors; the core only hands them off.
pub trait TcpForwarder: Send + Sync {
    fn register(&self, spec: &ApiDescriptor);
}

/// Summary of one reload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    pub abandoned: usize,
    pub unloaded: usize,
}

enum Processed {
    Http {
        spec: Arc<ApiDescriptor>,
        chain: Arc<ApiChain>,
    },
    Tcp {
        spec: Arc<ApiDescriptor>,
    },
}

/// End-to-end reload orchestration: diff, swap, unload.
///
/// All build work happens on private structures; the descriptor lock is held
/// only around the final table installation, and request threads resolve the
/// live tables through single atomic loads.
pub struct ApiLoader {
    config: Arc<GatewayConfig>,
    composer: Composer,
    ambient: AmbientStores,
    flags: Arc<RuntimeFlags>,
    routers: Arc<ArcSwap<RouterSet>>,
    descriptors: Arc<ArcSwap<HashMap<String, Arc<ApiDescriptor>>>>,
    chains: Arc<ArcSwap<HashMap<String, Arc<ApiChain>>>>,
    api_lock: Mutex<()>,
    loop_engine: Arc<LoopEngine>,
    unload_hooks: Vec<Arc<dyn UnloadHook>>,
    tcp_forwarder: Option<Arc<dyn TcpForwarder>>,
    kv_resolver: Option<Arc<dyn KvResolver>>,
    chain_options: Vec<ChainOption>,
}

impl ApiLoader {
    pub fn new(
        config: Arc<GatewayConfig>,
        ambient: AmbientStores,
        driver_host: Arc<dyn DriverHost>,
    ) -> Self {
        let descriptors: Arc<ArcSwap<HashMap<String, Arc<ApiDescriptor>>>> =
            Arc::new(ArcSwap::new(Arc::new(HashMap::new())));
        let chains: Arc<ArcSwap<HashMap<String, Arc<ApiChain>>>> =
            Arc::new(ArcSwap::new(Arc::new(HashMap::new())));
        let loop_engine = Arc::new(LoopEngine::new(descriptors.clone(), chains.clone()));

        let mut initial = RouterSet::new();
        initial.mount_control(&config);

        Self {
            composer: Composer::new(config.clone(), driver_host),
            config,
            ambient,
            flags: Arc::new(RuntimeFlags::default()),
            routers: Arc::new(ArcSwap::new(Arc::new(initial))),
            descriptors,
            chains,
            api_lock: Mutex::new(()),
            loop_engine,
            unload_hooks: Vec::new(),
            tcp_forwarder: None,
            kv_resolver: None,
            chain_options: Vec::new(),
        }
    }

    pub fn with_unload_hook(mut self, hook: Arc<dyn UnloadHook>) -> Self {
        self.unload_hooks.push(hook);
        self
    }

    pub fn with_tcp_forwarder(mut self, forwarder: Arc<dyn TcpForwarder>) -> Self {
        self.tcp_forwarder = Some(forwarder);
        self
    }

    pub fn with_kv_resolver(mut self, resolver: Arc<dyn KvResolver>) -> Self {
        self.kv_resolver = Some(resolver);
        self
    }

    /// Options threaded into every composed chain (quota-key override).
    pub fn with_chain_options(mut self, opts: Vec<ChainOption>) -> Self {
        self.chain_options = opts;
        self
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn flags(&self) -> &Arc<RuntimeFlags> {
        &self.flags
    }

    pub fn loop_engine(&self) -> Arc<LoopEngine> {
        self.loop_engine.clone()
    }

    /// Current router set (one atomic load).
    pub fn routers(&self) -> Arc<RouterSet> {
        self.routers.load_full()
    }

    pub fn resolve(&self, key: ListenKey, host: Option<&str>, path: &str) -> Resolution {
        self.routers.load().resolve(key, host, path)
    }

    pub fn chain_for(&self, api_id: &str) -> Option<Arc<ApiChain>> {
        self.chains.load().get(api_id).cloned()
    }

    pub fn descriptor_for(&self, api_id: &str) -> Option<Arc<ApiDescriptor>> {
        self.descriptors.load().get(api_id).cloned()
    }

    /// Load a descriptor set, replacing whatever is currently live.
    pub fn load(&self, mut specs: Vec<ApiDescriptor>) -> LoadReport {
        let mut report = LoadReport::default();

        // Snapshot, sort, and clear loader-managed version links.
        sort_descriptors(&mut specs);
        for spec in &mut specs {
            spec.version_data.base_api_id = None;
        }

        // Collision map, read and updated by the arbiter.
        let mut collisions = build_collision_map(&specs, &self.config);

        // Fresh registry with the control API pre-mounted; unmatched
        // requests fall through to the 404 handler in the serving layer.
        let mut routers = RouterSet::new();
        routers.mount_control(&self.config);

        let prev_specs = self.descriptors.load_full();
        let prev_chains = self.chains.load_full();

        let mut new_specs: HashMap<String, Arc<ApiDescriptor>> = HashMap::new();
        let mut new_chains: HashMap<String, Arc<ApiChain>> = HashMap::new();

        for spec in specs {
            let api_id = spec.api_id.clone();
            let name = spec.name.clone();
            let is_oas = spec.is_oas;
            let prev = prev_specs.get(&api_id).cloned();
            let prev_chain = prev_chains.get(&api_id).cloned();

            let processed = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.process_one(spec, &mut collisions, prev.as_deref(), prev_chain.as_ref())
            }));

            match processed {
                Ok(Processed::Http { spec, chain }) => {
                    if chain.skip {
                        report.skipped += 1;
                    } else {
                        routers.register_api(&self.config, &spec, &chain);
                        report.loaded += 1;
                    }
                    new_specs.insert(api_id.clone(), spec);
                    new_chains.insert(api_id, chain);
                }
                Ok(Processed::Tcp { spec }) => {
                    match &self.tcp_forwarder {
                        Some(forwarder) => forwarder.register(&spec),
                        None => warn!(api_id = %spec.api_id, "TCP service declared but no forwarder wired"),
                    }
                    new_specs.insert(api_id, spec);
                    report.loaded += 1;
                }
                Err(panic) => {
                    // The descriptor is abandoned; the reload goes on.
                    if is_oas {
                        warn!(api_id = %api_id, "OAS API definition has no gateway extension, skipping");
                    } else {
                        let msg = panic_message(&panic);
                        error!(
                            api_id = %api_id,
                            name = %name,
                            panic = %msg,
                            backtrace = %Backtrace::force_capture(),
                            "Panic while loading API, descriptor abandoned"
                        );
                    }
                    report.abandoned += 1;
                }
            }
        }

        // Re-link version children to their base descriptor.
        relink_versions(&mut new_specs);

        // One pointer swap per table, under the API lock.
        {
            let _guard = self.api_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.routers.store(Arc::new(routers));
            self.descriptors.store(Arc::new(new_specs));
            self.chains.store(Arc::new(new_chains));
        }

        // Diff against the previous generation and unload the losers.
        let current = self.descriptors.load();
        for (api_id, old_spec) in prev_specs.iter() {
            let gone = match current.get(api_id) {
                None => true,
                Some(new_spec) => !new_spec.same_definition(old_spec),
            };
            if gone {
                info!(api_id = %api_id, "unloading API");
                for hook in &self.unload_hooks {
                    hook.api_unloaded(old_spec);
                }
                report.unloaded += 1;
            }
        }

        // All-mTLS fleets need a reachable control surface.
        if !current.is_empty()
            && current.values().all(|s| s.use_mutual_tls_auth)
            && self.config.control_api_port.is_none()
            && self.config.control_api_hostname.is_empty()
        {
            warn!(
                "All APIs enforce mutual TLS but the control API shares their listener; \
                 configure a dedicated control-API port or hostname"
            );
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            abandoned = report.abandoned,
            unloaded = report.unloaded,
            "API load complete"
        );
        report
    }

    fn process_one(
        &self,
        spec: ApiDescriptor,
        collisions: &mut HashMap<String, usize>,
        prev: Option<&ApiDescriptor>,
        prev_chain: Option<&Arc<ApiChain>>,
    ) -> Processed {
        let mut spec = spec;
        // Keep the generated object id stable across reloads, else the
        // equality predicate would rebuild every chain.
        if spec.id.is_empty() {
            if let Some(prev) = prev {
                spec.id = prev.id.clone();
            }
        }
        spec.normalise(&self.config, self.kv_resolver.as_deref());

        // OAS-shaped descriptors without the gateway extension blow up the
        // same way the native chain builder would.
        if spec.is_oas && spec.oas_extension.is_none() {
            panic!("no gateway extension in OAS API definition {}", spec.api_id);
        }

        if spec.is_tcp_family() {
            return Processed::Tcp {
                spec: Arc::new(spec),
            };
        }

        if let Err(reason) = spec.validate() {
            warn!(api_id = %spec.api_id, reason = %reason, "API descriptor rejected, will not be registered");
            let spec = Arc::new(spec);
            return Processed::Http {
                chain: Arc::new(ApiChain::invalid(spec.clone(), reason.to_string())),
                spec,
            };
        }

        if !spec.active {
            warn!(api_id = %spec.api_id, "API is inactive, will not be registered");
            let spec = Arc::new(spec);
            return Processed::Http {
                chain: Arc::new(ApiChain::invalid(spec.clone(), "API is inactive".to_string())),
                spec,
            };
        }

        arbitrate_listen_path(&mut spec, collisions, prev, &self.config);

        // Unchanged descriptors keep their chain object across reloads.
        if let (Some(prev), Some(prev_chain)) = (prev, prev_chain) {
            if prev.same_definition(&spec) {
                return Processed::Http {
                    spec: Arc::new(spec),
                    chain: prev_chain.clone(),
                };
            }
        }

        let stores = bind_stores(&spec, &self.ambient, &self.config, &self.flags);
        let spec_arc = Arc::new(spec.clone());
        let chain = self
            .composer
            .compose(spec, &stores, &self.chain_options);
        Processed::Http {
            spec: spec_arc,
            chain: Arc::new(chain),
        }
    }
}

fn relink_versions(specs: &mut HashMap<String, Arc<ApiDescriptor>>) {
    let mut links: Vec<(String, String)> = Vec::new();
    for (base_id, spec) in specs.iter() {
        for info in spec.version_data.versions.values() {
            if let Some(child_id) = &info.api_id {
                if specs.contains_key(child_id) {
                    links.push((child_id.clone(), base_id.clone()));
                }
            }
        }
    }
    for (child_id, base_id) in links {
        if let Some(child) = specs.get_mut(&child_id) {
            Arc::make_mut(child).version_data.base_api_id = Some(base_id);
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
