use crate::stage::{json_response, RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use gantry_core::descriptor::ApiDescriptor;
use gantry_core::error::GatewayError;
use gantry_store::StorageHandler;
use std::sync::Arc;

/// Remove client credentials before the request leaves for the upstream.
pub struct StripAuth {
    spec: Arc<ApiDescriptor>,
}

impl StripAuth {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for StripAuth {
    fn name(&self) -> &'static str {
        "strip-auth"
    }

    fn enabled(&self) -> bool {
        self.spec.authenticated() && self.spec.strip_auth_data
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let header = self.spec.auth.auth_header_name.clone();
        ctx.headers.remove(header.as_str());
        StageOutcome::Continue
    }
}

/// Reject keys past their expiry.
pub struct KeyExpired {
    spec: Arc<ApiDescriptor>,
}

impl KeyExpired {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for KeyExpired {
    fn name(&self) -> &'static str {
        "key-expired"
    }

    fn enabled(&self) -> bool {
        self.spec.authenticated()
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        match &ctx.identity {
            Some(session) if session.is_expired(chrono::Utc::now().timestamp()) => {
                StageOutcome::Error(GatewayError::KeyExpired)
            }
            Some(_) => StageOutcome::Continue,
            None => StageOutcome::Error(GatewayError::AuthFailed("no session on request".into())),
        }
    }
}

/// The key must hold an access grant for this API (empty grants = legacy
/// unrestricted key).
pub struct AccessRights {
    spec: Arc<ApiDescriptor>,
}

impl AccessRights {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for AccessRights {
    fn name(&self) -> &'static str {
        "access-rights"
    }

    fn enabled(&self) -> bool {
        self.spec.authenticated()
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(session) = &ctx.identity else {
            return StageOutcome::Error(GatewayError::AuthFailed("no session on request".into()));
        };
        if session.access_rights.is_empty() {
            return StageOutcome::Continue;
        }
        match session.access_rights.get(&self.spec.api_id) {
            Some(grant) => {
                if !grant.versions.is_empty() {
                    let version = ctx.version.clone().unwrap_or_default();
                    if !grant.versions.contains(&version) {
                        return StageOutcome::Error(GatewayError::AccessDenied(
                            "version not allowed for this key".into(),
                        ));
                    }
                }
                StageOutcome::Continue
            }
            None => StageOutcome::Error(GatewayError::AccessDenied(
                "Access to this API has been disallowed".into(),
            )),
        }
    }
}

/// URL-level grants within an API.
pub struct GranularAccess {
    spec: Arc<ApiDescriptor>,
}

impl GranularAccess {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for GranularAccess {
    fn name(&self) -> &'static str {
        "granular-access"
    }

    fn enabled(&self) -> bool {
        self.spec.authenticated()
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(session) = &ctx.identity else {
            return StageOutcome::Continue;
        };
        let Some(grant) = session.access_rights.get(&self.spec.api_id) else {
            return StageOutcome::Continue;
        };
        if grant.allowed_urls.is_empty() {
            return StageOutcome::Continue;
        }

        let method = ctx.method.as_str();
        let path = ctx.path();
        let allowed = grant.allowed_urls.iter().any(|rule| {
            let path_ok = regex::Regex::new(&rule.url)
                .map(|re| re.is_match(path))
                .unwrap_or_else(|_| path.starts_with(&rule.url));
            let method_ok =
                rule.methods.is_empty() || rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
            path_ok && method_ok
        });

        if allowed {
            StageOutcome::Continue
        } else {
            StageOutcome::Error(GatewayError::AccessDenied(
                "Access to this resource has been disallowed".into(),
            ))
        }
    }
}

/// Per-key rate and quota accounting against the bound session store.
pub struct RateLimitAndQuota {
    spec: Arc<ApiDescriptor>,
    session_store: Arc<dyn StorageHandler>,
}

impl RateLimitAndQuota {
    pub fn new(spec: Arc<ApiDescriptor>, session_store: Arc<dyn StorageHandler>) -> Self {
        Self {
            spec,
            session_store,
        }
    }
}

#[async_trait]
impl Stage for RateLimitAndQuota {
    fn name(&self) -> &'static str {
        "rate-limit-quota"
    }

    fn enabled(&self) -> bool {
        self.spec.authenticated()
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        // Inner loop hops only account against the quota when the caller
        // asked for it (check_limits).
        if ctx.loop_state.level > 0 && !ctx.loop_state.check_limits {
            return StageOutcome::Continue;
        }
        let Some(session) = ctx.identity.as_mut() else {
            return StageOutcome::Continue;
        };
        if session.quota_max <= 0 {
            return StageOutcome::Continue;
        }
        if session.quota_remaining <= 0 {
            return StageOutcome::Error(GatewayError::QuotaExceeded);
        }

        session.quota_remaining -= 1;
        let key = session.key_id.clone();
        let ttl = self.spec.session_lifetime;
        if let Ok(raw) = serde_json::to_string(&session) {
            if let Err(e) = self.session_store.set_key(&key, &raw, ttl).await {
                tracing::warn!(key = %key, error = %e, "quota write-back failed");
            }
        }
        StageOutcome::Continue
    }
}

/// API-level limiter independent of the caller's key. The counter key can be
/// overridden at compose time (quota-key option).
pub struct ApiRateLimit {
    spec: Arc<ApiDescriptor>,
    session_store: Arc<dyn StorageHandler>,
    quota_key: String,
}

impl ApiRateLimit {
    pub fn new(
        spec: Arc<ApiDescriptor>,
        session_store: Arc<dyn StorageHandler>,
        quota_key: String,
    ) -> Self {
        Self {
            spec,
            session_store,
            quota_key,
        }
    }

    fn counter_key(&self) -> String {
        if self.quota_key.is_empty() {
            format!("rate-limit-{}", self.spec.api_id)
        } else {
            self.quota_key.clone()
        }
    }
}

#[async_trait]
impl Stage for ApiRateLimit {
    fn name(&self) -> &'static str {
        "api-rate-limit"
    }

    fn enabled(&self) -> bool {
        self.spec.global_rate_limit.rate > 0.0
    }

    async fn handle(&self, _ctx: &mut RequestCtx) -> StageOutcome {
        let key = self.counter_key();
        let count = self
            .session_store
            .get_key(&key)
            .await
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if (count as f64) >= self.spec.global_rate_limit.rate {
            return StageOutcome::Error(GatewayError::RateLimited);
        }

        let window = self.spec.global_rate_limit.per.max(1.0) as i64;
        if let Err(e) = self
            .session_store
            .set_key(&key, &(count + 1).to_string(), window)
            .await
        {
            tracing::warn!(key = %key, error = %e, "rate counter write failed");
        }
        StageOutcome::Continue
    }
}

/// Terminal of the rate-limit side-chain: report the caller's live counters.
pub struct RateLimitReport;

#[async_trait]
impl Stage for RateLimitReport {
    fn name(&self) -> &'static str {
        "rate-limit-report"
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let (quota_remaining, quota_renews, rate, per) = match &ctx.identity {
            Some(s) => (s.quota_remaining, s.quota_renews, s.rate, s.per),
            None => (0, 0, 0.0, 0.0),
        };
        StageOutcome::Respond(json_response(
            200,
            serde_json::json!({
                "quota_remaining": quota_remaining,
                "quota_renews": quota_renews,
                "rate_limit": { "rate": rate, "per": per },
            }),
        ))
    }
}
