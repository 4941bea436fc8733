use crate::stage::{RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use base64::Engine;
use gantry_core::descriptor::ApiDescriptor;
use gantry_store::StorageHandler;
use std::sync::Arc;
use tracing::debug;

/// Decorate the outbound request with upstream basic credentials.
pub struct UpstreamBasicAuthStage {
    spec: Arc<ApiDescriptor>,
}

impl UpstreamBasicAuthStage {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for UpstreamBasicAuthStage {
    fn name(&self) -> &'static str {
        "upstream-basic-auth"
    }

    fn enabled(&self) -> bool {
        self.spec.upstream_auth.basic_auth.enabled
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let basic = &self.spec.upstream_auth.basic_auth;
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", basic.username, basic.password));
        let header_name = if basic.header_name.is_empty() {
            "authorization"
        } else {
            basic.header_name.as_str()
        };
        if let (Ok(n), Ok(v)) = (
            http::header::HeaderName::try_from(header_name),
            http::header::HeaderValue::try_from(format!("Basic {}", credentials)),
        ) {
            ctx.headers.insert(n, v);
        }
        StageOutcome::Continue
    }
}

/// Decorate the outbound request with an upstream OAuth bearer token.
/// Token acquisition happens out-of-process; the freshest token is read from
/// the per-API cache store.
pub struct UpstreamOAuthStage {
    spec: Arc<ApiDescriptor>,
    cache_store: Arc<dyn StorageHandler>,
}

impl UpstreamOAuthStage {
    pub fn new(spec: Arc<ApiDescriptor>, cache_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, cache_store }
    }
}

#[async_trait]
impl Stage for UpstreamOAuthStage {
    fn name(&self) -> &'static str {
        "upstream-oauth"
    }

    fn enabled(&self) -> bool {
        self.spec.upstream_auth.oauth.enabled
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        match self.cache_store.get_key("upstream-oauth-token").await {
            Ok(token) => {
                if let Ok(v) = http::header::HeaderValue::try_from(format!("Bearer {}", token)) {
                    ctx.headers.insert(http::header::AUTHORIZATION, v);
                }
            }
            Err(_) => {
                debug!(
                    api_id = %self.spec.api_id,
                    token_url = %self.spec.upstream_auth.oauth.token_url,
                    "no upstream token cached yet"
                );
            }
        }
        StageOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gantry_store::memory::InMemoryStore;
    use http::Method;

    #[tokio::test]
    async fn test_upstream_basic_auth_header() {
        let spec: Arc<ApiDescriptor> = Arc::new(
            serde_json::from_value(serde_json::json!({
                "api_id": "u1",
                "listen_path": "/u1/",
                "target_url": "http://upstream.local",
                "upstream_auth": {"basic_auth": {
                    "enabled": true, "username": "svc", "password": "pw",
                }},
            }))
            .unwrap(),
        );
        let stage = UpstreamBasicAuthStage::new(spec);
        assert!(stage.enabled());
        let mut ctx = RequestCtx::new(
            Method::GET,
            "/u1/x".parse().unwrap(),
            http::HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        );
        stage.handle(&mut ctx).await;
        let expected = base64::engine::general_purpose::STANDARD.encode("svc:pw");
        assert_eq!(
            ctx.headers.get("authorization").unwrap().to_str().unwrap(),
            format!("Basic {}", expected)
        );
    }

    #[tokio::test]
    async fn test_upstream_oauth_reads_cached_token() {
        let spec: Arc<ApiDescriptor> = Arc::new(
            serde_json::from_value(serde_json::json!({
                "api_id": "u2",
                "listen_path": "/u2/",
                "target_url": "http://upstream.local",
                "upstream_auth": {"oauth": {"enabled": true, "token_url": "http://as.local/token"}},
            }))
            .unwrap(),
        );
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new());
        store.set_key("upstream-oauth-token", "tok-1", 0).await.unwrap();
        let stage = UpstreamOAuthStage::new(spec, store);
        let mut ctx = RequestCtx::new(
            Method::GET,
            "/u2/x".parse().unwrap(),
            http::HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        );
        stage.handle(&mut ctx).await;
        assert_eq!(
            ctx.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer tok-1"
        );
    }
}
