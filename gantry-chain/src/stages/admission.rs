use crate::stage::{RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use gantry_core::descriptor::ApiDescriptor;
use gantry_core::error::GatewayError;
use gantry_core::session::SessionState;
use gantry_store::StorageHandler;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Resolve the request's version tag and reject unknown versions.
pub struct VersionCheck {
    spec: Arc<ApiDescriptor>,
}

impl VersionCheck {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for VersionCheck {
    fn name(&self) -> &'static str {
        "version-check"
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let vd = &self.spec.version_data;
        if vd.not_versioned {
            ctx.version = Some("Default".to_string());
            return StageOutcome::Continue;
        }

        let requested = ctx
            .header("x-api-version")
            .map(|v| v.to_string())
            .or_else(|| ctx.query_param("v"))
            .unwrap_or_else(|| vd.default_version.clone());

        if requested.is_empty() || (!vd.versions.is_empty() && !vd.versions.contains_key(&requested))
        {
            return StageOutcome::Error(GatewayError::VersionNotFound);
        }
        ctx.version = Some(requested);
        StageOutcome::Continue
    }
}

/// CORS preflight handling.
pub struct Cors {
    spec: Arc<ApiDescriptor>,
}

impl Cors {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn enabled(&self) -> bool {
        self.spec.cors.enable
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        if ctx.method != http::Method::OPTIONS {
            return StageOutcome::Continue;
        }
        let cors = &self.spec.cors;
        let origins = if cors.allowed_origins.is_empty() {
            "*".to_string()
        } else {
            cors.allowed_origins.join(", ")
        };
        let methods = if cors.allowed_methods.is_empty() {
            "GET, POST, PUT, DELETE, OPTIONS".to_string()
        } else {
            cors.allowed_methods.join(", ")
        };
        let resp = http::Response::builder()
            .status(204)
            .header("access-control-allow-origin", origins)
            .header("access-control-allow-methods", methods)
            .header(
                "access-control-allow-headers",
                cors.allowed_headers.join(", "),
            )
            .body(bytes::Bytes::new())
            .unwrap_or_default();
        StageOutcome::Respond(resp)
    }
}

/// Global admission check ahead of any per-key limiting. The distributed
/// limiter proper is a collaborator; this stage stamps arrival metadata.
pub struct RateCheck {
    spec: Arc<ApiDescriptor>,
}

impl RateCheck {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for RateCheck {
    fn name(&self) -> &'static str {
        "rate-check"
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        debug!(api_id = %self.spec.api_id, "rate check");
        ctx.set_var(
            "request_arrived_at",
            serde_json::json!(chrono::Utc::now().timestamp_millis()),
        );
        StageOutcome::Continue
    }
}

fn ip_in_list(client_ip: &str, list: &[String]) -> bool {
    let Ok(addr) = client_ip.parse::<IpAddr>() else {
        return false;
    };
    list.iter().any(|entry| {
        if let Ok(net) = entry.parse::<ipnet::IpNet>() {
            net.contains(&addr)
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            ip == addr
        } else {
            false
        }
    })
}

/// Reject clients outside the allow-list.
pub struct IpAllowList {
    spec: Arc<ApiDescriptor>,
}

impl IpAllowList {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for IpAllowList {
    fn name(&self) -> &'static str {
        "ip-allow-list"
    }

    fn enabled(&self) -> bool {
        self.spec.enable_ip_whitelisting && !self.spec.allowed_ips.is_empty()
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        if ip_in_list(&ctx.client_ip, &self.spec.allowed_ips) {
            StageOutcome::Continue
        } else {
            StageOutcome::Error(GatewayError::AccessDenied(format!(
                "IP address not allowed: {}",
                ctx.client_ip
            )))
        }
    }
}

/// Reject clients on the deny-list.
pub struct IpDenyList {
    spec: Arc<ApiDescriptor>,
}

impl IpDenyList {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for IpDenyList {
    fn name(&self) -> &'static str {
        "ip-deny-list"
    }

    fn enabled(&self) -> bool {
        self.spec.enable_ip_blacklisting && !self.spec.blacklisted_ips.is_empty()
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        if ip_in_list(&ctx.client_ip, &self.spec.blacklisted_ips) {
            StageOutcome::Error(GatewayError::AccessDenied(format!(
                "IP address blocked: {}",
                ctx.client_ip
            )))
        } else {
            StageOutcome::Continue
        }
    }
}

/// Require a verified client certificate (flag set by the TLS listener).
pub struct ClientCertCheck {
    spec: Arc<ApiDescriptor>,
}

impl ClientCertCheck {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for ClientCertCheck {
    fn name(&self) -> &'static str {
        "client-cert-check"
    }

    fn enabled(&self) -> bool {
        self.spec.use_mutual_tls_auth
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let verified = ctx
            .vars
            .get("client_cert_verified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if verified {
            StageOutcome::Continue
        } else {
            StageOutcome::Error(GatewayError::AccessDenied(
                "certificate required".into(),
            ))
        }
    }
}

/// Organisation-level quota guard.
pub struct OrgMonitor {
    spec: Arc<ApiDescriptor>,
    org_store: Arc<dyn StorageHandler>,
    enforce: bool,
}

impl OrgMonitor {
    pub fn new(spec: Arc<ApiDescriptor>, org_store: Arc<dyn StorageHandler>, enforce: bool) -> Self {
        Self {
            spec,
            org_store,
            enforce,
        }
    }
}

#[async_trait]
impl Stage for OrgMonitor {
    fn name(&self) -> &'static str {
        "org-monitor"
    }

    fn enabled(&self) -> bool {
        self.enforce && !self.spec.org_id.is_empty()
    }

    async fn handle(&self, _ctx: &mut RequestCtx) -> StageOutcome {
        match self.org_store.get_key(&self.spec.org_id).await {
            Ok(raw) => match serde_json::from_str::<SessionState>(&raw) {
                Ok(org) if org.quota_max > 0 && org.quota_remaining <= 0 => {
                    StageOutcome::Error(GatewayError::QuotaExceeded)
                }
                _ => StageOutcome::Continue,
            },
            Err(_) => StageOutcome::Continue,
        }
    }
}

/// Bound the request body size.
pub struct RequestSizeLimit {
    spec: Arc<ApiDescriptor>,
}

impl RequestSizeLimit {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for RequestSizeLimit {
    fn name(&self) -> &'static str {
        "request-size-limit"
    }

    fn enabled(&self) -> bool {
        self.spec.max_request_size > 0
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let declared = ctx
            .header("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(ctx.body.len() as i64);
        if declared > self.spec.max_request_size || ctx.body.len() as i64 > self.spec.max_request_size
        {
            StageOutcome::Error(GatewayError::RequestTooLarge)
        } else {
            StageOutcome::Continue
        }
    }
}

/// Extract request metadata into the shared context-variable bag.
pub struct ContextVars {
    spec: Arc<ApiDescriptor>,
}

impl ContextVars {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for ContextVars {
    fn name(&self) -> &'static str {
        "context-vars"
    }

    fn enabled(&self) -> bool {
        self.spec.enable_context_vars
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        ctx.set_var("request_id", serde_json::json!(uuid::Uuid::new_v4().to_string()));
        ctx.set_var("remote_addr", serde_json::json!(ctx.client_ip.clone()));
        ctx.set_var("path", serde_json::json!(ctx.path()));
        for header in &self.spec.tag_headers {
            if let Some(value) = ctx.header(header) {
                let key = format!("header_{}", header.replace('-', "_"));
                let tagged = serde_json::json!(value);
                ctx.set_var(&key, tagged);
            }
        }
        StageOutcome::Continue
    }
}

/// Mark whether the matched endpoint participates in analytics tracking.
pub struct EndpointTracker {
    spec: Arc<ApiDescriptor>,
}

impl EndpointTracker {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for EndpointTracker {
    fn name(&self) -> &'static str {
        "endpoint-tracker"
    }

    fn enabled(&self) -> bool {
        !self.spec.tracked_endpoints.is_empty() || self.spec.do_not_track
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let tracked = !self.spec.do_not_track
            && self
                .spec
                .tracked_endpoints
                .iter()
                .any(|p| ctx.path().starts_with(p.as_str()));
        ctx.set_var("track_path", serde_json::json!(tracked));
        StageOutcome::Continue
    }
}
