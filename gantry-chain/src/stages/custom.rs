use crate::stage::{RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use gantry_core::descriptor::{ApiDescriptor, Driver, HookDef, VirtualMeta};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Where in the chain a custom hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    PostAuth,
    Post,
    Response,
    AuthCheck,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Pre => "pre",
            HookKind::PostAuth => "post_key_auth",
            HookKind::Post => "post",
            HookKind::Response => "response",
            HookKind::AuthCheck => "auth_check",
        }
    }
}

/// Host for descriptor-declared hooks. Native-plugin, scripted, and
/// out-of-process drivers are external collaborators behind this contract.
#[async_trait]
pub trait DriverHost: Send + Sync {
    async fn invoke(
        &self,
        driver: Driver,
        kind: HookKind,
        def: &HookDef,
        ctx: &mut RequestCtx,
    ) -> StageOutcome;

    /// Virtual-endpoint function execution (scripted driver).
    async fn invoke_virtual(&self, meta: &VirtualMeta, ctx: &mut RequestCtx) -> StageOutcome {
        let _ = (meta, ctx);
        StageOutcome::Continue
    }
}

/// Host that accepts every hook without effect. Used when no driver runtime
/// is wired in.
pub struct NullDriverHost;

#[async_trait]
impl DriverHost for NullDriverHost {
    async fn invoke(
        &self,
        driver: Driver,
        kind: HookKind,
        def: &HookDef,
        _ctx: &mut RequestCtx,
    ) -> StageOutcome {
        debug!(
            driver = ?driver,
            kind = kind.as_str(),
            symbol = %def.symbol_name,
            "No driver host wired; hook skipped"
        );
        StageOutcome::Continue
    }
}

/// One descriptor-declared hook as a chain stage, dispatched by driver tag.
pub struct CustomStage {
    spec: Arc<ApiDescriptor>,
    kind: HookKind,
    def: HookDef,
    host: Arc<dyn DriverHost>,
}

impl CustomStage {
    pub fn new(
        spec: Arc<ApiDescriptor>,
        kind: HookKind,
        def: HookDef,
        host: Arc<dyn DriverHost>,
    ) -> Self {
        Self {
            spec,
            kind,
            def,
            host,
        }
    }
}

#[async_trait]
impl Stage for CustomStage {
    fn name(&self) -> &'static str {
        match self.kind {
            HookKind::Pre => "custom-pre",
            HookKind::PostAuth => "custom-post-auth",
            HookKind::Post => "custom-post",
            HookKind::Response => "custom-response",
            HookKind::AuthCheck => "custom-auth",
        }
    }

    fn enabled(&self) -> bool {
        match self.kind {
            // Post-auth hooks only make sense behind the auth block.
            HookKind::PostAuth => self.spec.authenticated(),
            HookKind::AuthCheck => self.spec.use_custom_plugin_auth,
            _ => true,
        }
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        self.host
            .invoke(self.spec.custom_middleware.driver, self.kind, &self.def, ctx)
            .await
    }
}

/// Rewrite hook paths under the unpacked bundle root. Applies when the
/// descriptor carries a bundle and the native-plugin driver; the join is
/// lowercased in place.
pub fn rewrite_bundle_paths(spec: &mut ApiDescriptor, bundle_root: &Path) {
    if spec.custom_middleware.bundle.is_empty()
        || spec.custom_middleware.driver != Driver::GoPlugin
    {
        return;
    }

    let base = bundle_root.join(&spec.api_id);
    let rewrite = |def: &mut HookDef| {
        if !def.path.is_empty() {
            def.path = base
                .join(&def.path)
                .to_string_lossy()
                .to_ascii_lowercase();
        }
    };

    let mw = &mut spec.custom_middleware;
    mw.pre.iter_mut().for_each(rewrite);
    mw.post_key_auth.iter_mut().for_each(rewrite);
    mw.post.iter_mut().for_each(rewrite);
    mw.response.iter_mut().for_each(rewrite);
    if let Some(def) = mw.auth_check.as_mut() {
        rewrite(def);
    }
}
