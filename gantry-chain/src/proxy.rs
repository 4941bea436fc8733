use crate::stage::{RequestCtx, Stage, StageOutcome};
use crate::stages::custom::{DriverHost, HookKind};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use gantry_core::descriptor::ApiDescriptor;
use gantry_core::error::GatewayError;
use gantry_core::LOOP_SCHEME;
use gantry_store::StorageHandler;
use http::Uri;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Shared upstream transport for both sink flavours.
struct Forwarder {
    spec: Arc<ApiDescriptor>,
    client: reqwest::Client,
    response_hooks: Vec<gantry_core::descriptor::HookDef>,
    driver_host: Arc<dyn DriverHost>,
    cache_store: Arc<dyn StorageHandler>,
    lb_counter: AtomicUsize,
}

impl Forwarder {
    fn new(
        spec: Arc<ApiDescriptor>,
        driver_host: Arc<dyn DriverHost>,
        cache_store: Arc<dyn StorageHandler>,
        upstream_timeout: Duration,
    ) -> Self {
        let response_hooks = spec.custom_middleware.response.clone();
        let client = reqwest::Client::builder()
            .timeout(upstream_timeout)
            .build()
            .unwrap_or_default();
        Self {
            spec,
            client,
            response_hooks,
            driver_host,
            cache_store,
            lb_counter: AtomicUsize::new(0),
        }
    }

    /// Round-robin pick when load balancing is on, declared target otherwise.
    fn base_target(&self) -> String {
        let proxy = &self.spec.proxy;
        if proxy.enable_load_balancing && !proxy.target_list.is_empty() {
            let idx = self.lb_counter.fetch_add(1, Ordering::Relaxed) % proxy.target_list.len();
            proxy.target_list[idx].clone()
        } else {
            self.spec.target_url.clone()
        }
    }

    /// Effective target for this request: loop/rewrite override first.
    fn effective_target(&self, ctx: &RequestCtx, declared: &str) -> Result<Uri, GatewayError> {
        if let Some(outbound) = &ctx.outbound {
            return Ok(outbound.clone());
        }
        declared
            .parse::<Uri>()
            .map_err(|e| GatewayError::Upstream(format!("bad upstream target: {}", e)))
    }

    async fn forward(&self, ctx: &mut RequestCtx, declared: &str) -> StageOutcome {
        let target = match self.effective_target(ctx, declared) {
            Ok(t) => t,
            Err(e) => return StageOutcome::Error(e),
        };

        // Internal-scheme targets re-enter the gateway instead of leaving it.
        if target.scheme_str() == Some(LOOP_SCHEME) {
            let Some(dispatcher) = ctx.dispatcher.clone() else {
                return StageOutcome::Error(GatewayError::LoopTargetNotFound);
            };
            ctx.outbound = Some(target);
            return StageOutcome::Respond(dispatcher.dispatch(ctx).await);
        }

        let url = match self.upstream_url(ctx, &target) {
            Ok(u) => u,
            Err(e) => return StageOutcome::Error(e),
        };
        debug!(api_id = %self.spec.api_id, url = %url, "proxying upstream");

        let method = reqwest::Method::from_bytes(ctx.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut request = self.client.request(method, &url);
        for (name, value) in ctx.headers.iter() {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                request = request.header(name.as_str(), v);
            }
        }
        if !ctx.body.is_empty() {
            request = request.body(ctx.body.clone());
        }

        let upstream = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return StageOutcome::Error(GatewayError::Upstream(e.to_string())),
        };

        let status = upstream.status().as_u16();
        let mut builder = http::Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let body = match upstream.bytes().await {
            Ok(b) => Bytes::from(b.to_vec()),
            Err(e) => return StageOutcome::Error(GatewayError::Upstream(e.to_string())),
        };

        self.populate_cache(ctx, status, &body).await;

        let mut response = builder.body(body).unwrap_or_default();

        for def in &self.response_hooks {
            match self
                .driver_host
                .invoke(
                    self.spec.custom_middleware.driver,
                    HookKind::Response,
                    def,
                    ctx,
                )
                .await
            {
                StageOutcome::Respond(overridden) => response = overridden,
                StageOutcome::Error(e) => return StageOutcome::Error(e),
                StageOutcome::Continue => {}
            }
        }

        StageOutcome::Respond(response)
    }

    /// Fill the entry the cache responder missed on.
    async fn populate_cache(&self, ctx: &mut RequestCtx, status: u16, body: &Bytes) {
        if status != 200 {
            return;
        }
        let Some(key) = ctx.take_var("cache_store_key") else {
            return;
        };
        let ttl = ctx
            .vars
            .remove("cache_ttl")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        if let Err(e) = self.cache_store.set_key(&key, &encoded, ttl).await {
            warn!(key = %key, error = %e, "cache population failed");
        }
    }

    /// Join the upstream base with the request path and query.
    fn upstream_url(&self, ctx: &RequestCtx, target: &Uri) -> Result<String, GatewayError> {
        let scheme = target.scheme_str().unwrap_or("http");
        let authority = target
            .authority()
            .ok_or_else(|| GatewayError::Upstream("upstream target has no host".into()))?;

        let mut request_path = ctx.path().to_string();
        if self.spec.proxy.strip_listen_path {
            if let Some(rest) = request_path.strip_prefix(self.spec.listen_path.trim_end_matches('/'))
            {
                request_path = if rest.is_empty() { "/".into() } else { rest.to_string() };
            }
        }

        let base_path = target.path().trim_end_matches('/');
        let mut url = format!("{}://{}{}{}", scheme, authority, base_path, request_path);
        if let Some(query) = ctx.uri.query() {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }
}

/// Terminal sink proxying to the descriptor's single target.
pub struct ReverseProxy {
    fw: Forwarder,
}

impl ReverseProxy {
    pub fn new(
        spec: Arc<ApiDescriptor>,
        driver_host: Arc<dyn DriverHost>,
        cache_store: Arc<dyn StorageHandler>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            fw: Forwarder::new(spec, driver_host, cache_store, upstream_timeout),
        }
    }
}

#[async_trait]
impl Stage for ReverseProxy {
    fn name(&self) -> &'static str {
        "reverse-proxy"
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let declared = self.fw.base_target();
        self.fw.forward(ctx, &declared).await
    }
}

/// Terminal sink routing by resolved version: versions with an override
/// target go there, everything else to the declared target.
pub struct MultiTargetProxy {
    fw: Forwarder,
    targets: HashMap<String, String>,
}

impl MultiTargetProxy {
    pub fn new(
        spec: Arc<ApiDescriptor>,
        driver_host: Arc<dyn DriverHost>,
        cache_store: Arc<dyn StorageHandler>,
        upstream_timeout: Duration,
    ) -> Self {
        let targets = spec
            .version_data
            .versions
            .iter()
            .filter_map(|(name, info)| {
                info.override_target
                    .as_ref()
                    .filter(|t| !t.is_empty())
                    .map(|t| (name.clone(), t.clone()))
            })
            .collect();
        Self {
            fw: Forwarder::new(spec, driver_host, cache_store, upstream_timeout),
            targets,
        }
    }

    fn target_for(&self, ctx: &RequestCtx) -> String {
        let version = ctx
            .version
            .clone()
            .unwrap_or_else(|| self.fw.spec.version_data.default_version.clone());
        self.targets
            .get(&version)
            .cloned()
            .unwrap_or_else(|| self.fw.base_target())
    }
}

#[async_trait]
impl Stage for MultiTargetProxy {
    fn name(&self) -> &'static str {
        "multi-target-proxy"
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let declared = self.target_for(ctx);
        self.fw.forward(ctx, &declared).await
    }
}
