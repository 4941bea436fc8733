use crate::chain::{ApiChain, Chain, TraceWrap};
use crate::options::{ChainOption, ComposeOptions};
use crate::proxy::{MultiTargetProxy, ReverseProxy};
use crate::stage::Stage;
use crate::stages::admission::{
    ClientCertCheck, ContextVars, Cors, EndpointTracker, IpAllowList, IpDenyList, OrgMonitor,
    RateCheck, RequestSizeLimit, VersionCheck,
};
use crate::stages::auth::{
    BasicAuth, ExternalOAuth, HmacSignature, Jwt, OAuthKey, OpenId, TokenAuth,
};
use crate::stages::custom::{rewrite_bundle_paths, CustomStage, DriverHost, HookKind};
use crate::stages::graphql::{GraphqlComplexity, GraphqlGranularAccess, GraphqlRouter};
use crate::stages::identity::{
    AccessRights, ApiRateLimit, GranularAccess, KeyExpired, RateLimitAndQuota, RateLimitReport,
    StripAuth,
};
use crate::stages::responders::{CacheResponder, MockResponder, RequestSigning, VirtualEndpoint};
use crate::stages::transform::{
    BodyTransform, HeaderTransform, JqTransform, MethodTransform, PersistedGraphql,
    RequestValidate, SchemaValidate, UrlRewrite,
};
use crate::stages::upstream_auth::{UpstreamBasicAuthStage, UpstreamOAuthStage};
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::{ApiDescriptor, Driver};
use gantry_store::binder::BoundStores;
use std::sync::Arc;
use tracing::debug;

/// Append a stage only when it enables itself for this descriptor.
fn append(list: &mut Vec<Arc<dyn Stage>>, stage: Arc<dyn Stage>) {
    if stage.enabled() {
        list.push(stage);
    }
}

/// Builds the per-API handler chain and its rate-limit side-chain.
///
/// The composer is declarative and performs no I/O: every stage is
/// conditionally appended from descriptor flags, in a fixed sequence.
pub struct Composer {
    config: Arc<GatewayConfig>,
    driver_host: Arc<dyn DriverHost>,
}

impl Composer {
    pub fn new(config: Arc<GatewayConfig>, driver_host: Arc<dyn DriverHost>) -> Self {
        Self {
            config,
            driver_host,
        }
    }

    pub fn compose(
        &self,
        spec: ApiDescriptor,
        stores: &BoundStores,
        opts: &[ChainOption],
    ) -> ApiChain {
        let mut spec = spec;
        rewrite_bundle_paths(&mut spec, &self.config.bundle_root);
        let spec = Arc::new(spec);
        let opts = ComposeOptions::from_slice(opts);

        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

        // 1. Pre-auth, unconditional.
        append(&mut stages, Arc::new(VersionCheck::new(spec.clone())));
        append(&mut stages, Arc::new(Cors::new(spec.clone())));

        // 2. Custom pre-hooks, in declared order.
        for def in &spec.custom_middleware.pre {
            append(
                &mut stages,
                Arc::new(CustomStage::new(
                    spec.clone(),
                    HookKind::Pre,
                    def.clone(),
                    self.driver_host.clone(),
                )),
            );
        }

        // 3. Request admission.
        append(&mut stages, Arc::new(RateCheck::new(spec.clone())));
        append(&mut stages, Arc::new(IpAllowList::new(spec.clone())));
        append(&mut stages, Arc::new(IpDenyList::new(spec.clone())));
        append(&mut stages, Arc::new(ClientCertCheck::new(spec.clone())));
        append(
            &mut stages,
            Arc::new(OrgMonitor::new(
                spec.clone(),
                stores.org.clone(),
                self.config.enforce_org_quotas,
            )),
        );
        append(&mut stages, Arc::new(RequestSizeLimit::new(spec.clone())));
        append(&mut stages, Arc::new(ContextVars::new(spec.clone())));
        append(&mut stages, Arc::new(EndpointTracker::new(spec.clone())));

        // 4. Authentication block; the sub-sequence is shared verbatim with
        //    the rate-limit side-chain.
        let mut auth_stages: Vec<Arc<dyn Stage>> = Vec::new();
        if spec.authenticated() {
            append(
                &mut auth_stages,
                Arc::new(OAuthKey::new(spec.clone(), stores.auth.clone())),
            );
            append(
                &mut auth_stages,
                Arc::new(ExternalOAuth::new(spec.clone(), stores.auth.clone())),
            );
            append(
                &mut auth_stages,
                Arc::new(BasicAuth::new(spec.clone(), stores.auth.clone())),
            );
            append(
                &mut auth_stages,
                Arc::new(HmacSignature::new(spec.clone(), stores.auth.clone())),
            );
            append(
                &mut auth_stages,
                Arc::new(Jwt::new(spec.clone(), stores.auth.clone())),
            );
            append(&mut auth_stages, Arc::new(OpenId::new(spec.clone())));
            if let Some(def) = &spec.custom_middleware.auth_check {
                append(
                    &mut auth_stages,
                    Arc::new(CustomStage::new(
                        spec.clone(),
                        HookKind::AuthCheck,
                        def.clone(),
                        self.driver_host.clone(),
                    )),
                );
            }
            if auth_stages.is_empty() || spec.use_standard_auth {
                append(
                    &mut auth_stages,
                    Arc::new(TokenAuth::new(
                        spec.clone(),
                        stores.auth.clone(),
                        self.config.hash_keys,
                    )),
                );
            }
            stages.extend(auth_stages.iter().cloned());
        }

        // 5. Post-auth hooks.
        for def in &spec.custom_middleware.post_key_auth {
            append(
                &mut stages,
                Arc::new(CustomStage::new(
                    spec.clone(),
                    HookKind::PostAuth,
                    def.clone(),
                    self.driver_host.clone(),
                )),
            );
        }

        // 6. Identity / authorization.
        append(&mut stages, Arc::new(StripAuth::new(spec.clone())));
        append(&mut stages, Arc::new(KeyExpired::new(spec.clone())));
        append(&mut stages, Arc::new(AccessRights::new(spec.clone())));
        append(&mut stages, Arc::new(GranularAccess::new(spec.clone())));
        append(
            &mut stages,
            Arc::new(RateLimitAndQuota::new(spec.clone(), stores.session.clone())),
        );

        // 7. Per-API limits & GraphQL.
        append(
            &mut stages,
            Arc::new(ApiRateLimit::new(
                spec.clone(),
                stores.session.clone(),
                opts.quota_key.clone(),
            )),
        );
        append(
            &mut stages,
            Arc::new(GraphqlRouter::new(spec.clone(), self.config.clone())),
        );
        if spec.authenticated() {
            append(&mut stages, Arc::new(GraphqlComplexity::new(spec.clone())));
            append(
                &mut stages,
                Arc::new(GraphqlGranularAccess::new(spec.clone())),
            );
        }

        // 8. Upstream auth decorators.
        append(
            &mut stages,
            Arc::new(UpstreamBasicAuthStage::new(spec.clone())),
        );
        append(
            &mut stages,
            Arc::new(UpstreamOAuthStage::new(spec.clone(), stores.cache.clone())),
        );

        // 9. Body/shape transforms.
        append(&mut stages, Arc::new(SchemaValidate::new(spec.clone())));
        append(&mut stages, Arc::new(RequestValidate::new(spec.clone())));
        append(&mut stages, Arc::new(PersistedGraphql::new(spec.clone())));
        append(&mut stages, Arc::new(BodyTransform::new(spec.clone())));
        append(&mut stages, Arc::new(JqTransform::new(spec.clone())));
        append(&mut stages, Arc::new(HeaderTransform::new(spec.clone())));
        append(&mut stages, Arc::new(UrlRewrite::new(spec.clone())));
        append(&mut stages, Arc::new(MethodTransform::new(spec.clone())));

        // 10. Short-circuit responders, then the final native-plugin slot.
        append(&mut stages, Arc::new(MockResponder::new(spec.clone())));
        append(
            &mut stages,
            Arc::new(CacheResponder::new(spec.clone(), stores.cache.clone())),
        );
        append(
            &mut stages,
            Arc::new(VirtualEndpoint::new(spec.clone(), self.driver_host.clone())),
        );
        append(&mut stages, Arc::new(RequestSigning::new(spec.clone())));
        if spec.custom_middleware.driver == Driver::GoPlugin {
            for def in &spec.custom_middleware.post {
                append(
                    &mut stages,
                    Arc::new(CustomStage::new(
                        spec.clone(),
                        HookKind::Post,
                        def.clone(),
                        self.driver_host.clone(),
                    )),
                );
            }
        }

        // 11. Custom post-hooks for the scripted / out-of-process drivers.
        if spec.custom_middleware.driver != Driver::GoPlugin {
            for def in &spec.custom_middleware.post {
                append(
                    &mut stages,
                    Arc::new(CustomStage::new(
                        spec.clone(),
                        HookKind::Post,
                        def.clone(),
                        self.driver_host.clone(),
                    )),
                );
            }
        }

        // 12. Terminal sink.
        let upstream_timeout =
            std::time::Duration::from_secs(self.config.http_server_options.read_timeout_secs);
        let sink: Arc<dyn Stage> = if spec.has_version_overrides() {
            Arc::new(MultiTargetProxy::new(
                spec.clone(),
                self.driver_host.clone(),
                stores.cache.clone(),
                upstream_timeout,
            ))
        } else {
            Arc::new(ReverseProxy::new(
                spec.clone(),
                self.driver_host.clone(),
                stores.cache.clone(),
                upstream_timeout,
            ))
        };

        let handler = Arc::new(Chain::new(stages, sink).wrapped(self.trace_wrap(&spec)));
        let rate_limit_handler = spec
            .authenticated()
            .then(|| Arc::new(self.side_chain(&spec, stores, &auth_stages)));

        debug!(
            api_id = %spec.api_id,
            stages = handler.stage_names().len(),
            "chain composed"
        );

        ApiChain {
            handler,
            rate_limit_handler,
            open: spec.use_keyless,
            skip: spec.internal,
            descriptor: spec,
        }
    }

    /// The shorter chain mounted at `<listen_path>/tyk/rate-limits/`.
    fn side_chain(
        &self,
        spec: &Arc<ApiDescriptor>,
        stores: &BoundStores,
        auth_stages: &[Arc<dyn Stage>],
    ) -> Chain {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();
        append(&mut stages, Arc::new(IpAllowList::new(spec.clone())));
        append(&mut stages, Arc::new(IpDenyList::new(spec.clone())));
        append(
            &mut stages,
            Arc::new(OrgMonitor::new(
                spec.clone(),
                stores.org.clone(),
                self.config.enforce_org_quotas,
            )),
        );
        append(&mut stages, Arc::new(VersionCheck::new(spec.clone())));
        stages.extend(auth_stages.iter().cloned());
        append(&mut stages, Arc::new(KeyExpired::new(spec.clone())));
        append(&mut stages, Arc::new(AccessRights::new(spec.clone())));
        Chain::new(stages, Arc::new(RateLimitReport))
    }

    /// At most one tracing wrapper; distributed tracing wins over OTel.
    fn trace_wrap(&self, spec: &ApiDescriptor) -> TraceWrap {
        if self.config.tracing.enabled {
            TraceWrap::Tracing {
                span_name: spec.name.clone(),
            }
        } else if self.config.opentelemetry.enabled {
            TraceWrap::Otel {
                api_id: spec.api_id.clone(),
                api_name: spec.name.clone(),
                org_id: spec.org_id.clone(),
            }
        } else {
            TraceWrap::None
        }
    }
}
