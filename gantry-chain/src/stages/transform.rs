use crate::stage::{RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use gantry_core::descriptor::{ApiDescriptor, ExtendedPaths};
use gantry_core::error::GatewayError;
use gantry_core::{CTX_TRANSFORM_METHOD, CTX_URL_REWRITE_TARGET, LOOP_SCHEME};
use http::Uri;
use std::sync::Arc;
use tracing::debug;

fn endpoint_matches(meta_path: &str, meta_method: &str, ctx: &RequestCtx) -> bool {
    let path_ok = meta_path.is_empty() || ctx.path().starts_with(meta_path);
    let method_ok = meta_method.is_empty() || meta_method.eq_ignore_ascii_case(ctx.method.as_str());
    path_ok && method_ok
}

/// Validate request bodies against declared JSON schemas.
pub struct SchemaValidate {
    spec: Arc<ApiDescriptor>,
}

impl SchemaValidate {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for SchemaValidate {
    fn name(&self) -> &'static str {
        "schema-validate"
    }

    fn enabled(&self) -> bool {
        self.spec.any_version(|p: &ExtendedPaths| !p.validate_json.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.validate_json {
                if !endpoint_matches(&rule.path, &rule.method, ctx) {
                    continue;
                }
                let parsed: Result<serde_json::Value, _> = serde_json::from_slice(&ctx.body);
                let Ok(body) = parsed else {
                    return StageOutcome::Error(GatewayError::ValidationFailed(
                        "request body is not valid JSON".into(),
                    ));
                };
                if let Some(required) = rule.schema.get("required").and_then(|r| r.as_array()) {
                    for field in required.iter().filter_map(|f| f.as_str()) {
                        if body.get(field).is_none() {
                            return StageOutcome::Error(GatewayError::ValidationFailed(format!(
                                "missing required field: {}",
                                field
                            )));
                        }
                    }
                }
            }
        }
        StageOutcome::Continue
    }
}

/// OAS-style request validation marker; the full validator is a collaborator.
pub struct RequestValidate {
    spec: Arc<ApiDescriptor>,
}

impl RequestValidate {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for RequestValidate {
    fn name(&self) -> &'static str {
        "request-validate"
    }

    fn enabled(&self) -> bool {
        self.spec
            .any_version(|p: &ExtendedPaths| p.validate_request.iter().any(|r| r.enabled))
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        ctx.set_var("request_validated", serde_json::json!(true));
        StageOutcome::Continue
    }
}

/// Replace inbound GraphQL bodies with the persisted operation.
pub struct PersistedGraphql {
    spec: Arc<ApiDescriptor>,
}

impl PersistedGraphql {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for PersistedGraphql {
    fn name(&self) -> &'static str {
        "persisted-graphql"
    }

    fn enabled(&self) -> bool {
        self.spec.graphql.enabled
            && self
                .spec
                .any_version(|p: &ExtendedPaths| !p.persist_graphql.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.persist_graphql {
                if endpoint_matches(&rule.path, &rule.method, ctx) {
                    let body = serde_json::json!({
                        "query": rule.operation,
                        "variables": rule.variables,
                    });
                    ctx.body = bytes::Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
                    ctx.method = http::Method::POST;
                    return StageOutcome::Continue;
                }
            }
        }
        StageOutcome::Continue
    }
}

/// Body templating hand-off; the template engine is a collaborator.
pub struct BodyTransform {
    spec: Arc<ApiDescriptor>,
}

impl BodyTransform {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for BodyTransform {
    fn name(&self) -> &'static str {
        "body-transform"
    }

    fn enabled(&self) -> bool {
        self.spec.any_version(|p: &ExtendedPaths| !p.transform.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.transform {
                if endpoint_matches(&rule.path, &rule.method, ctx) {
                    ctx.set_var("body_transform_template", serde_json::json!(rule.template));
                }
            }
        }
        StageOutcome::Continue
    }
}

/// JQ filter hand-off.
pub struct JqTransform {
    spec: Arc<ApiDescriptor>,
}

impl JqTransform {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for JqTransform {
    fn name(&self) -> &'static str {
        "jq-transform"
    }

    fn enabled(&self) -> bool {
        self.spec.any_version(|p: &ExtendedPaths| !p.transform_jq.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.transform_jq {
                if endpoint_matches(&rule.path, &rule.method, ctx) {
                    ctx.set_var("jq_filter", serde_json::json!(rule.filter));
                }
            }
        }
        StageOutcome::Continue
    }
}

/// Header injection and deletion.
pub struct HeaderTransform {
    spec: Arc<ApiDescriptor>,
}

impl HeaderTransform {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for HeaderTransform {
    fn name(&self) -> &'static str {
        "header-transform"
    }

    fn enabled(&self) -> bool {
        self.spec
            .any_version(|p: &ExtendedPaths| !p.transform_headers.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let mut add: Vec<(String, String)> = Vec::new();
        let mut del: Vec<String> = Vec::new();
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.transform_headers {
                if endpoint_matches(&rule.path, &rule.method, ctx) {
                    add.extend(rule.add_headers.iter().map(|(k, v)| (k.clone(), v.clone())));
                    del.extend(rule.delete_headers.iter().cloned());
                }
            }
        }
        for name in del {
            ctx.headers.remove(name.as_str());
        }
        for (name, value) in add {
            if let (Ok(n), Ok(v)) = (
                http::header::HeaderName::try_from(name.as_str()),
                http::header::HeaderValue::try_from(value.as_str()),
            ) {
                ctx.headers.insert(n, v);
            }
        }
        StageOutcome::Continue
    }
}

/// Regex URL rewriting. Rewrites to the reserved internal scheme store the
/// target for the loop dispatcher and save the original host/query for
/// restoration on the inner hop.
pub struct UrlRewrite {
    spec: Arc<ApiDescriptor>,
}

impl UrlRewrite {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for UrlRewrite {
    fn name(&self) -> &'static str {
        "url-rewrite"
    }

    fn enabled(&self) -> bool {
        self.spec.any_version(|p: &ExtendedPaths| !p.url_rewrites.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.url_rewrites {
                if !endpoint_matches(&rule.path, &rule.method, ctx) {
                    continue;
                }
                let Ok(re) = regex::Regex::new(&rule.match_pattern) else {
                    debug!(pattern = %rule.match_pattern, "unusable rewrite pattern");
                    continue;
                };
                let path = ctx.path().to_string();
                if !re.is_match(&path) {
                    continue;
                }
                let rewritten = re.replace(&path, rule.rewrite_to.as_str()).to_string();

                if rewritten.starts_with(&format!("{}://", LOOP_SCHEME)) {
                    if let Ok(target) = rewritten.parse::<Uri>() {
                        ctx.loop_state.saved_host = ctx
                            .uri
                            .authority()
                            .map(|a| a.to_string())
                            .or_else(|| ctx.header("host").map(|h| h.to_string()));
                        ctx.loop_state.saved_query = ctx.uri.query().map(|q| q.to_string());
                        ctx.set_var(CTX_URL_REWRITE_TARGET, serde_json::json!(rewritten));
                        ctx.outbound = Some(target);
                    }
                } else if let Ok(new_uri) = rewritten.parse::<Uri>() {
                    ctx.uri = new_uri;
                }
                return StageOutcome::Continue;
            }
        }
        StageOutcome::Continue
    }
}

/// Endpoint-level method replacement. The dispatcher consumes the stored
/// method on internal hops; the sink uses the mutated method otherwise.
pub struct MethodTransform {
    spec: Arc<ApiDescriptor>,
}

impl MethodTransform {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for MethodTransform {
    fn name(&self) -> &'static str {
        "method-transform"
    }

    fn enabled(&self) -> bool {
        self.spec
            .any_version(|p: &ExtendedPaths| !p.method_transforms.is_empty())
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        for version in self.spec.version_data.versions.values() {
            for rule in &version.extended_paths.method_transforms {
                if !endpoint_matches(&rule.path, &rule.method, ctx) {
                    continue;
                }
                if let Ok(method) = rule.to_method.to_ascii_uppercase().parse::<http::Method>() {
                    ctx.set_var(CTX_TRANSFORM_METHOD, serde_json::json!(rule.to_method));
                    ctx.method = method;
                }
                return StageOutcome::Continue;
            }
        }
        StageOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Method;

    fn spec(extended: serde_json::Value) -> Arc<ApiDescriptor> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "api_id": "t1",
                "listen_path": "/t1/",
                "target_url": "http://upstream.local",
                "version_data": {
                    "not_versioned": false,
                    "default_version": "v1",
                    "versions": {"v1": {"extended_paths": extended}},
                },
            }))
            .unwrap(),
        )
    }

    fn ctx(method: Method, uri: &str) -> RequestCtx {
        RequestCtx::new(
            method,
            uri.parse().unwrap(),
            http::HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        )
    }

    #[tokio::test]
    async fn test_method_transform_sets_context_field() {
        let stage = MethodTransform::new(spec(serde_json::json!({
            "method_transforms": [{"path": "/t1/legacy", "method": "GET", "to_method": "POST"}],
        })));
        assert!(stage.enabled());
        let mut c = ctx(Method::GET, "/t1/legacy");
        stage.handle(&mut c).await;
        assert_eq!(c.method, Method::POST);
        assert_eq!(
            c.vars.get(CTX_TRANSFORM_METHOD).and_then(|v| v.as_str()),
            Some("POST")
        );
    }

    #[tokio::test]
    async fn test_url_rewrite_to_internal_scheme() {
        let stage = UrlRewrite::new(spec(serde_json::json!({
            "url_rewrites": [{
                "path": "/t1/inner",
                "match_pattern": "^/t1/inner(.*)",
                "rewrite_to": "tyk://self/v2$1",
            }],
        })));
        let mut c = ctx(Method::GET, "http://edge.example.com/t1/inner/data?q=1");
        stage.handle(&mut c).await;
        let outbound = c.outbound.expect("internal rewrite must set outbound");
        assert_eq!(outbound.scheme_str(), Some("tyk"));
        assert_eq!(outbound.host(), Some("self"));
        assert_eq!(c.loop_state.saved_query.as_deref(), Some("q=1"));
        assert!(c.vars.contains_key(CTX_URL_REWRITE_TARGET));
    }

    #[tokio::test]
    async fn test_plain_url_rewrite_mutates_path() {
        let stage = UrlRewrite::new(spec(serde_json::json!({
            "url_rewrites": [{
                "path": "/t1/old",
                "match_pattern": "^/t1/old(.*)",
                "rewrite_to": "/t1/new$1",
            }],
        })));
        let mut c = ctx(Method::GET, "/t1/old/thing");
        stage.handle(&mut c).await;
        assert_eq!(c.path(), "/t1/new/thing");
        assert!(c.outbound.is_none());
    }

    #[tokio::test]
    async fn test_header_transform() {
        let stage = HeaderTransform::new(spec(serde_json::json!({
            "transform_headers": [{
                "path": "",
                "method": "",
                "add_headers": {"x-injected": "yes"},
                "delete_headers": ["x-remove-me"],
            }],
        })));
        let mut c = ctx(Method::GET, "/t1/x");
        c.headers.insert("x-remove-me", "gone".parse().unwrap());
        stage.handle(&mut c).await;
        assert!(c.headers.get("x-remove-me").is_none());
        assert_eq!(c.headers.get("x-injected").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_schema_validate_requires_fields() {
        let stage = SchemaValidate::new(spec(serde_json::json!({
            "validate_json": [{
                "path": "/t1/users",
                "method": "POST",
                "schema": {"required": ["name"]},
            }],
        })));
        let mut c = ctx(Method::POST, "/t1/users");
        c.body = Bytes::from_static(br#"{"name": "jo"}"#);
        assert!(matches!(stage.handle(&mut c).await, StageOutcome::Continue));

        c.body = Bytes::from_static(br#"{"other": 1}"#);
        assert!(matches!(stage.handle(&mut c).await, StageOutcome::Error(_)));
    }
}
