use crate::stage::{error_response, RequestCtx, Stage, StageOutcome};
use bytes::Bytes;
use gantry_core::descriptor::ApiDescriptor;
use gantry_core::error::GatewayError;
use http::Response;
use std::sync::Arc;
use tracing::{debug, error, Instrument};

/// How an assembled chain is wrapped for tracing. At most one wrapper.
#[derive(Debug, Clone)]
pub enum TraceWrap {
    None,
    /// Distributed tracing: the span is named after the API.
    Tracing { span_name: String },
    /// OpenTelemetry-style span with descriptor-derived attributes.
    Otel {
        api_id: String,
        api_name: String,
        org_id: String,
    },
}

/// An ordered sequence of middleware stages terminating in a sink.
pub struct Chain {
    stages: Vec<Arc<dyn Stage>>,
    sink: Arc<dyn Stage>,
    wrap: TraceWrap,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Stage>>, sink: Arc<dyn Stage>) -> Self {
        Self {
            stages,
            sink,
            wrap: TraceWrap::None,
        }
    }

    pub fn wrapped(mut self, wrap: TraceWrap) -> Self {
        self.wrap = wrap;
        self
    }

    /// Stage names in execution order, sink last. Used by tests and the
    /// loader's debug logging.
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.stages.iter().map(|s| s.name()).collect();
        names.push(self.sink.name());
        names
    }

    /// Run the chain to completion.
    pub async fn serve(&self, ctx: &mut RequestCtx) -> Response<Bytes> {
        match &self.wrap {
            TraceWrap::None => self.run(ctx).await,
            TraceWrap::Tracing { span_name } => {
                let span = tracing::info_span!("api", name = %span_name);
                self.run(ctx).instrument(span).await
            }
            TraceWrap::Otel {
                api_id,
                api_name,
                org_id,
            } => {
                let span = tracing::info_span!(
                    "gateway.request",
                    api.id = %api_id,
                    api.name = %api_name,
                    api.org = %org_id,
                );
                self.run(ctx).instrument(span).await
            }
        }
    }

    async fn run(&self, ctx: &mut RequestCtx) -> Response<Bytes> {
        for stage in &self.stages {
            debug!(stage = stage.name(), "Executing stage");
            match stage.handle(ctx).await {
                StageOutcome::Continue => {}
                StageOutcome::Respond(resp) => {
                    debug!(stage = stage.name(), status = resp.status().as_u16(), "Stage short-circuited");
                    return resp;
                }
                StageOutcome::Error(err) => {
                    error!(stage = stage.name(), error = %err, "Stage failed");
                    return error_response(&err);
                }
            }
        }

        match self.sink.handle(ctx).await {
            StageOutcome::Respond(resp) => resp,
            StageOutcome::Error(err) => {
                error!(sink = self.sink.name(), error = %err, "Sink failed");
                error_response(&err)
            }
            StageOutcome::Continue => {
                error_response(&GatewayError::Internal("sink produced no response".into()))
            }
        }
    }
}

/// Per-descriptor compiled artifact owned by the loader.
pub struct ApiChain {
    pub handler: Arc<Chain>,
    /// Absent for keyless APIs.
    pub rate_limit_handler: Option<Arc<Chain>>,
    /// Keyless.
    pub open: bool,
    /// Invalid or internal: never registered on a router.
    pub skip: bool,
    pub descriptor: Arc<ApiDescriptor>,
}

impl ApiChain {
    /// Chain object for a rejected descriptor: kept in the chain table so
    /// reloads do not oscillate, never registered, and any dispatch into it
    /// renders the rejection.
    pub fn invalid(descriptor: Arc<ApiDescriptor>, reason: String) -> Self {
        let sink: Arc<dyn Stage> = Arc::new(RejectSink {
            reason: reason.clone(),
        });
        Self {
            handler: Arc::new(Chain::new(Vec::new(), sink)),
            rate_limit_handler: None,
            open: false,
            skip: true,
            descriptor,
        }
    }
}

struct RejectSink {
    reason: String,
}

#[async_trait::async_trait]
impl Stage for RejectSink {
    fn name(&self) -> &'static str {
        "reject"
    }

    async fn handle(&self, _ctx: &mut RequestCtx) -> StageOutcome {
        StageOutcome::Error(GatewayError::DescriptorInvalid(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::Method;

    struct PassThrough;

    #[async_trait]
    impl Stage for PassThrough {
        fn name(&self) -> &'static str {
            "pass"
        }
        async fn handle(&self, _ctx: &mut RequestCtx) -> StageOutcome {
            StageOutcome::Continue
        }
    }

    struct FixedSink(u16);

    #[async_trait]
    impl Stage for FixedSink {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn handle(&self, _ctx: &mut RequestCtx) -> StageOutcome {
            StageOutcome::Respond(crate::stage::json_response(self.0, serde_json::json!({})))
        }
    }

    struct Deny;

    #[async_trait]
    impl Stage for Deny {
        fn name(&self) -> &'static str {
            "deny"
        }
        async fn handle(&self, _ctx: &mut RequestCtx) -> StageOutcome {
            StageOutcome::Error(GatewayError::AccessDenied("denied".into()))
        }
    }

    fn ctx() -> RequestCtx {
        RequestCtx::new(
            Method::GET,
            "/x".parse().unwrap(),
            http::HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        )
    }

    #[tokio::test]
    async fn test_chain_runs_to_sink() {
        let chain = Chain::new(vec![Arc::new(PassThrough)], Arc::new(FixedSink(200)));
        let resp = chain.serve(&mut ctx()).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(chain.stage_names(), vec!["pass", "fixed"]);
    }

    #[tokio::test]
    async fn test_stage_error_short_circuits() {
        let chain = Chain::new(
            vec![Arc::new(Deny), Arc::new(PassThrough)],
            Arc::new(FixedSink(200)),
        );
        let resp = chain.serve(&mut ctx()).await;
        assert_eq!(resp.status(), 403);
    }

    #[tokio::test]
    async fn test_invalid_chain_renders_rejection() {
        let spec: ApiDescriptor = serde_json::from_value(serde_json::json!({
            "api_id": "bad",
            "listen_path": "",
        }))
        .unwrap();
        let chain = ApiChain::invalid(Arc::new(spec), "listen path is empty".into());
        assert!(chain.skip);
        assert!(chain.rate_limit_handler.is_none());
        let resp = chain.handler.serve(&mut ctx()).await;
        assert_eq!(resp.status(), 500);
    }
}
