use crate::stage::{RequestCtx, Stage, StageOutcome};
use crate::stages::custom::DriverHost;
use async_trait::async_trait;
use base64::Engine;
use gantry_core::descriptor::{ApiDescriptor, ExtendedPaths};
use gantry_store::StorageHandler;
use std::sync::Arc;
use tracing::debug;

fn endpoint_matches(meta_path: &str, meta_method: &str, ctx: &RequestCtx) -> bool {
    let path_ok = meta_path.is_empty() || ctx.path().starts_with(meta_path);
    let method_ok = meta_method.is_empty() || meta_method.eq_ignore_ascii_case(ctx.method.as_str());
    path_ok && method_ok
}

/// Serve declared mock responses without touching the upstream.
pub struct MockResponder {
    spec: Arc<ApiDescriptor>,
}

impl MockResponder {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for MockResponder {
    fn name(&self) -> &'static str {
        "mock-responder"
    }

    fn enabled(&self) -> bool {
        self.spec.any_version(|p: &ExtendedPaths| !p.mock_response.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for mock in &version.extended_paths.mock_response {
                if !endpoint_matches(&mock.path, &mock.method, ctx) {
                    continue;
                }
                let mut builder = http::Response::builder()
                    .status(if mock.code == 0 { 200 } else { mock.code });
                for (name, value) in &mock.headers {
                    builder = builder.header(name, value);
                }
                let resp = builder
                    .body(bytes::Bytes::from(mock.body.clone().into_bytes()))
                    .unwrap_or_default();
                return StageOutcome::Respond(resp);
            }
        }
        StageOutcome::Continue
    }
}

/// Serve cached responses from the per-API cache store.
pub struct CacheResponder {
    spec: Arc<ApiDescriptor>,
    cache_store: Arc<dyn StorageHandler>,
}

impl CacheResponder {
    pub fn new(spec: Arc<ApiDescriptor>, cache_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, cache_store }
    }

    fn cache_key(ctx: &RequestCtx) -> String {
        format!("{}:{}", ctx.method, ctx.path())
    }

    fn cacheable(&self, ctx: &RequestCtx) -> bool {
        if ctx.method != http::Method::GET {
            return false;
        }
        if self.spec.cache_options.cache_all_safe_requests {
            return true;
        }
        self.spec.any_version(|p| {
            p.cache
                .iter()
                .any(|path| ctx.path().starts_with(path.as_str()))
        })
    }
}

#[async_trait]
impl Stage for CacheResponder {
    fn name(&self) -> &'static str {
        "cache-responder"
    }

    fn enabled(&self) -> bool {
        self.spec.cache_options.enable_cache
            && (self.spec.cache_options.cache_all_safe_requests
                || self.spec.any_version(|p: &ExtendedPaths| !p.cache.is_empty()))
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        if !self.cacheable(ctx) {
            return StageOutcome::Continue;
        }
        let key = Self::cache_key(ctx);
        match self.cache_store.get_key(&key).await {
            Ok(cached) => {
                let body = base64::engine::general_purpose::STANDARD
                    .decode(&cached)
                    .unwrap_or_else(|_| cached.into_bytes());
                let resp = http::Response::builder()
                    .status(200)
                    .header("x-gantry-cache", "hit")
                    .body(bytes::Bytes::from(body))
                    .unwrap_or_default();
                StageOutcome::Respond(resp)
            }
            Err(_) => {
                // Miss: mark the request so the sink can populate the entry.
                ctx.set_var("cache_store_key", serde_json::json!(key));
                ctx.set_var(
                    "cache_ttl",
                    serde_json::json!(self.spec.cache_options.cache_timeout),
                );
                StageOutcome::Continue
            }
        }
    }
}

/// Scripted endpoint executed through the driver host instead of the
/// upstream.
pub struct VirtualEndpoint {
    spec: Arc<ApiDescriptor>,
    host: Arc<dyn DriverHost>,
}

impl VirtualEndpoint {
    pub fn new(spec: Arc<ApiDescriptor>, host: Arc<dyn DriverHost>) -> Self {
        Self { spec, host }
    }
}

#[async_trait]
impl Stage for VirtualEndpoint {
    fn name(&self) -> &'static str {
        "virtual-endpoint"
    }

    fn enabled(&self) -> bool {
        self.spec
            .any_version(|p: &ExtendedPaths| !p.virtual_endpoints.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for meta in &version.extended_paths.virtual_endpoints {
                if endpoint_matches(&meta.path, &meta.method, ctx) {
                    debug!(function = %meta.response_function_name, "virtual endpoint hit");
                    return self.host.invoke_virtual(meta, ctx).await;
                }
            }
        }
        StageOutcome::Continue
    }
}

/// Sign outbound requests with the descriptor's signing secret.
pub struct RequestSigning {
    spec: Arc<ApiDescriptor>,
}

impl RequestSigning {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for RequestSigning {
    fn name(&self) -> &'static str {
        "request-signing"
    }

    fn enabled(&self) -> bool {
        self.spec.request_signing.is_enabled
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        use hmac::{Hmac, Mac};

        let signing = &self.spec.request_signing;
        let date = chrono::Utc::now().to_rfc2822();
        let signing_string = format!("(request-target): {} {}\ndate: {}",
            ctx.method.as_str().to_ascii_lowercase(),
            ctx.path(),
            date,
        );
        let Ok(mut mac) = Hmac::<sha2::Sha256>::new_from_slice(signing.secret.as_bytes()) else {
            return StageOutcome::Continue;
        };
        mac.update(signing_string.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let header = format!(
            r#"Signature keyId="{}",algorithm="hmac-sha256",signature="{}""#,
            signing.key_id, signature
        );
        if let (Ok(n), Ok(v)) = (
            http::header::HeaderName::try_from("authorization"),
            http::header::HeaderValue::try_from(header.as_str()),
        ) {
            ctx.headers.insert(n, v);
        }
        if let Ok(v) = http::header::HeaderValue::try_from(date.as_str()) {
            ctx.headers.insert(http::header::DATE, v);
        }
        StageOutcome::Continue
    }
}
