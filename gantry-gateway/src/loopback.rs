use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use gantry_chain::chain::ApiChain;
use gantry_chain::stage::{error_response, InternalDispatcher, RequestCtx};
use gantry_core::descriptor::{canonical_loop_name, ApiDescriptor};
use gantry_core::error::GatewayError;
use gantry_core::{
    CTX_TRANSFORM_METHOD, CTX_URL_REWRITE_TARGET, DEFAULT_LOOP_LIMIT, LOOP_CHECK_LIMITS_PARAM,
    LOOP_LIMIT_PARAM, LOOP_METHOD_PARAM, LOOP_SCHEME, LOOP_SELF_HOST,
};
use http::{Response, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Renders loop-path failures for one API.
struct ErrorResponder {
    api_id: String,
}

impl ErrorResponder {
    fn for_api(api_id: &str) -> Self {
        Self {
            api_id: api_id.to_string(),
        }
    }

    fn respond(&self, err: &GatewayError) -> Response<Bytes> {
        error!(api_id = %self.api_id, error = %err, "loop dispatch failed");
        error_response(err)
    }
}

/// Resolves self- and cross-API internal redirects against the live route
/// table. Shares the loader's swapped descriptor and chain snapshots.
pub struct LoopEngine {
    descriptors: Arc<ArcSwap<HashMap<String, Arc<ApiDescriptor>>>>,
    chains: Arc<ArcSwap<HashMap<String, Arc<ApiChain>>>>,
}

impl LoopEngine {
    pub fn new(
        descriptors: Arc<ArcSwap<HashMap<String, Arc<ApiDescriptor>>>>,
        chains: Arc<ArcSwap<HashMap<String, Arc<ApiChain>>>>,
    ) -> Self {
        Self {
            descriptors,
            chains,
        }
    }

    /// Fuzzy match against the live descriptor set: by `api_id`, by internal
    /// object id, then by canonical name (case-insensitive, alphanumerics
    /// only, category-trimmed).
    pub fn find_target(&self, host: &str) -> Option<Arc<ApiChain>> {
        let chains = self.chains.load();
        if let Some(chain) = chains.get(host) {
            return Some(chain.clone());
        }

        let descriptors = self.descriptors.load();
        for (api_id, spec) in descriptors.iter() {
            if spec.id == host {
                return chains.get(api_id).cloned();
            }
        }

        let wanted = canonical_loop_name(host);
        if wanted.is_empty() {
            return None;
        }
        for (api_id, spec) in descriptors.iter() {
            if spec.loop_name() == wanted {
                return chains.get(api_id).cloned();
            }
        }
        None
    }

    /// One-shot redirect construction for descriptors whose own target is
    /// internal-scheme while the inbound URL is not: resolve the handler by
    /// name/id, sanitise the path, and stash the redirect target on the
    /// request context for the sink to dispatch.
    pub fn prepare_internal_redirect(
        &self,
        ctx: &mut RequestCtx,
        spec: &ApiDescriptor,
    ) -> Result<(), GatewayError> {
        let target: Uri = spec
            .target_url
            .parse()
            .map_err(|_| GatewayError::InternalRedirectFailed)?;
        if target.scheme_str() != Some(LOOP_SCHEME) || ctx.uri.scheme_str() == Some(LOOP_SCHEME) {
            return Ok(());
        }
        let host = target
            .host()
            .ok_or(GatewayError::InternalRedirectFailed)?
            .to_string();
        if host != LOOP_SELF_HOST && self.find_target(&host).is_none() {
            return Err(GatewayError::InternalRedirectFailed);
        }

        let path = sanitize_path(target.path());
        let mut redirect = format!("{}://{}{}", LOOP_SCHEME, host, path);
        if let Some(query) = target.query() {
            redirect.push('?');
            redirect.push_str(query);
        }
        ctx.outbound = Some(
            redirect
                .parse()
                .map_err(|_| GatewayError::InternalRedirectFailed)?,
        );
        debug!(api_id = %spec.api_id, target = %redirect, "internal redirect staged");
        Ok(())
    }
}

#[async_trait]
impl InternalDispatcher for LoopEngine {
    async fn dispatch(&self, ctx: &mut RequestCtx) -> Response<Bytes> {
        let responder = ErrorResponder::for_api(&ctx.api_id);

        // Context fields left by earlier middleware are consumed and
        // cleared before this hop.
        let target = match ctx.take_var(CTX_URL_REWRITE_TARGET) {
            Some(raw) => match raw.parse::<Uri>() {
                Ok(uri) => uri,
                Err(_) => return responder.respond(&GatewayError::LoopTargetNotFound),
            },
            None => match ctx.outbound.take() {
                Some(uri) => uri,
                None => return responder.respond(&GatewayError::LoopTargetNotFound),
            },
        };
        let transform_method = ctx.take_var(CTX_TRANSFORM_METHOD);
        ctx.outbound = Some(target.clone());

        // Per-request cap: an unparseable override is silently treated as 0,
        // which falls back to the default.
        let limit = match ctx.query_param(LOOP_LIMIT_PARAM) {
            Some(raw) => {
                let parsed = raw.parse::<u32>().unwrap_or(0);
                if parsed > 0 { parsed } else { DEFAULT_LOOP_LIMIT }
            }
            None => ctx.loop_state.limit,
        };
        if ctx
            .query_param(LOOP_CHECK_LIMITS_PARAM)
            .as_deref()
            == Some("true")
        {
            ctx.loop_state.check_limits = true;
        }
        let method_param = ctx.query_param(LOOP_METHOD_PARAM);
        ctx.outbound = None;

        if ctx.loop_state.level >= limit {
            return responder.respond(&GatewayError::LoopDepthExceeded(limit));
        }

        let host = target.host().unwrap_or_default().to_string();
        let chain = if host == LOOP_SELF_HOST {
            ctx.loop_state.self_loop = true;
            self.chains.load().get(&ctx.api_id).cloned()
        } else {
            self.find_target(&host)
        };
        let Some(chain) = chain else {
            let responder = ErrorResponder::for_api(&ctx.api_id);
            return responder.respond(&GatewayError::LoopTargetNotFound);
        };

        // Rewrite for the inner hop: http scheme, restored host/query,
        // optional method override, incremented level.
        let authority = ctx
            .loop_state
            .saved_host
            .take()
            .unwrap_or_else(|| host.clone());
        let query = ctx
            .loop_state
            .saved_query
            .take()
            .or_else(|| target.query().map(|q| q.to_string()));
        let mut rewritten = format!("http://{}{}", authority, sanitize_path(target.path()));
        if let Some(query) = &query {
            if !query.is_empty() {
                rewritten.push('?');
                rewritten.push_str(query);
            }
        }
        match rewritten.parse::<Uri>() {
            Ok(uri) => ctx.uri = uri,
            Err(_) => return responder.respond(&GatewayError::LoopTargetNotFound),
        }
        debug!(target = %ctx.uri, level = ctx.loop_state.level, "looping into chain");

        if let Some(method) = method_param.or(transform_method) {
            if let Ok(parsed) = method.to_ascii_uppercase().parse::<http::Method>() {
                ctx.method = parsed;
            }
        }

        ctx.loop_state.limit = limit;
        ctx.loop_state.level += 1;
        ctx.api_id = chain.descriptor.api_id.clone();

        chain.handler.serve(ctx).await
    }
}

/// Collapse duplicate slashes and drop traversal segments.
pub fn sanitize_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let joined = out.join("/");
    format!("/{}", joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(specs: Vec<ApiDescriptor>) -> LoopEngine {
        use gantry_chain::composer::Composer;
        use gantry_chain::stages::custom::NullDriverHost;
        use gantry_core::config::GatewayConfig;
        use gantry_store::binder::{bind_stores, AmbientStores, RuntimeFlags};

        let config = Arc::new(GatewayConfig::default());
        let ambient = AmbientStores::in_memory();
        let flags = RuntimeFlags::default();
        let composer = Composer::new(config.clone(), Arc::new(NullDriverHost));

        let mut descriptors = HashMap::new();
        let mut chains = HashMap::new();
        for spec in specs {
            let stores = bind_stores(&spec, &ambient, &config, &flags);
            let chain = composer.compose(spec.clone(), &stores, &[]);
            descriptors.insert(spec.api_id.clone(), Arc::new(spec));
            chains.insert(chain.descriptor.api_id.clone(), Arc::new(chain));
        }
        LoopEngine::new(
            Arc::new(ArcSwap::new(Arc::new(descriptors))),
            Arc::new(ArcSwap::new(Arc::new(chains))),
        )
    }

    fn spec(api_id: &str, name: &str) -> ApiDescriptor {
        serde_json::from_value(serde_json::json!({
            "api_id": api_id,
            "id": format!("obj-{}", api_id),
            "name": name,
            "listen_path": format!("/{}/", api_id),
            "target_url": "http://upstream.local",
        }))
        .unwrap()
    }

    #[test]
    fn test_find_target_by_api_id_and_object_id() {
        let engine = engine_with(vec![spec("orders", "Orders API")]);
        assert!(engine.find_target("orders").is_some());
        assert!(engine.find_target("obj-orders").is_some());
        assert!(engine.find_target("missing").is_none());
    }

    #[test]
    fn test_find_target_by_canonical_name() {
        let engine = engine_with(vec![spec("a1", "Orders API")]);
        assert!(engine.find_target("ordersapi").is_some());
        assert!(engine.find_target("Orders-API").is_some());
    }

    #[test]
    fn test_find_target_category_trimmed_name() {
        // `foo #bar` canonicalises to `foo`: the marker, its suffix, and the
        // character before it are dropped.
        let engine = engine_with(vec![spec("a1", "foo #bar")]);
        assert!(engine.find_target("foo").is_some());
        assert!(engine.find_target("foobar").is_none());
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/a//b/./c"), "/a/b/c");
        assert_eq!(sanitize_path("/a/../b"), "/b");
        assert_eq!(sanitize_path("/"), "/");
    }

    #[test]
    fn test_prepare_internal_redirect_unknown_target() {
        let engine = engine_with(vec![spec("a1", "A1")]);
        let mut target_spec = spec("a1", "A1");
        target_spec.target_url = "tyk://nonexistent/inner".into();
        let mut ctx = RequestCtx::new(
            http::Method::GET,
            "/a1/x".parse().unwrap(),
            http::HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        );
        assert!(matches!(
            engine.prepare_internal_redirect(&mut ctx, &target_spec),
            Err(GatewayError::InternalRedirectFailed)
        ));
    }

    #[test]
    fn test_prepare_internal_redirect_stages_target() {
        let engine = engine_with(vec![spec("inner", "Inner")]);
        let mut outer = spec("outer", "Outer");
        outer.target_url = "tyk://inner//double/../path".into();
        let mut ctx = RequestCtx::new(
            http::Method::GET,
            "/outer/x".parse().unwrap(),
            http::HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        );
        engine.prepare_internal_redirect(&mut ctx, &outer).unwrap();
        let outbound = ctx.outbound.unwrap();
        assert_eq!(outbound.scheme_str(), Some(LOOP_SCHEME));
        assert_eq!(outbound.host(), Some("inner"));
        assert_eq!(outbound.path(), "/path");
    }
}
