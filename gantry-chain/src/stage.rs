use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::error::GatewayError;
use gantry_core::session::SessionState;
use gantry_core::DEFAULT_LOOP_LIMIT;
use http::{HeaderMap, Method, Response, Uri};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of one stage execution.
#[derive(Debug)]
pub enum StageOutcome {
    /// Hand the request to the next stage.
    Continue,

    /// Short-circuit with a response (mock, cache hit, 401, 429, ...).
    Respond(Response<Bytes>),

    /// Abort with a gateway error; the chain renders the JSON body.
    Error(GatewayError),
}

/// Per-request loop bookkeeping, populated only by the loop dispatcher.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub level: u32,
    pub limit: u32,
    pub self_loop: bool,
    pub check_limits: bool,
    pub saved_host: Option<String>,
    pub saved_query: Option<String>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            level: 0,
            limit: DEFAULT_LOOP_LIMIT,
            self_loop: false,
            check_limits: false,
            saved_host: None,
            saved_query: None,
        }
    }
}

/// Mutable request context carried through a chain.
pub struct RequestCtx {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,

    /// API the chain currently serving this request belongs to.
    pub api_id: String,

    /// Version tag resolved by the version-check stage.
    pub version: Option<String>,

    /// Identity established by the authentication block.
    pub identity: Option<SessionState>,

    /// Shared context variables (middleware side channel).
    pub vars: HashMap<String, serde_json::Value>,

    /// Target override for the sink (loop dispatch, URL rewrite).
    pub outbound: Option<Uri>,

    pub loop_state: LoopState,

    /// Installed by the gateway so the sink can re-enter the route table.
    pub dispatcher: Option<Arc<dyn InternalDispatcher>>,
}

impl RequestCtx {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes, client_ip: String) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            client_ip,
            api_id: String::new(),
            version: None,
            identity: None,
            vars: HashMap::new(),
            outbound: None,
            loop_state: LoopState::default(),
            dispatcher: None,
        }
    }

    /// Request path component.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First value of a query parameter on the effective (outbound if set,
    /// else inbound) URL.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let uri = self.outbound.as_ref().unwrap_or(&self.uri);
        let query = uri.query()?;
        for pair in query.split('&') {
            let mut it = pair.splitn(2, '=');
            if it.next() == Some(name) {
                return Some(it.next().unwrap_or("").to_string());
            }
        }
        None
    }

    pub fn set_var(&mut self, key: &str, value: serde_json::Value) {
        self.vars.insert(key.to_string(), value);
    }

    /// Remove and return a string context variable.
    pub fn take_var(&mut self, key: &str) -> Option<String> {
        self.vars
            .remove(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }
}

/// One middleware stage.
///
/// The composer appends a stage only when `enabled()` holds, so a stage that
/// declines contributes nothing to the chain.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn enabled(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome;
}

/// Request-time re-entry into the live route table. Implemented by the
/// gateway's loop dispatcher; invoked by the sink when the effective target
/// carries the reserved internal scheme.
#[async_trait]
pub trait InternalDispatcher: Send + Sync {
    async fn dispatch(&self, ctx: &mut RequestCtx) -> Response<Bytes>;
}

/// JSON response helper shared by stages and sinks.
pub fn json_response(status: u16, body: serde_json::Value) -> Response<Bytes> {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(bytes))
        .unwrap_or_default()
}

/// Render a gateway error as its canonical JSON response.
pub fn error_response(err: &GatewayError) -> Response<Bytes> {
    Response::builder()
        .status(err.status_code())
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(err.to_json_body()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        let ctx = RequestCtx::new(
            Method::GET,
            "http://host/path?method=POST&loop_limit=3&flag".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        );
        assert_eq!(ctx.query_param("method").as_deref(), Some("POST"));
        assert_eq!(ctx.query_param("loop_limit").as_deref(), Some("3"));
        assert_eq!(ctx.query_param("flag").as_deref(), Some(""));
        assert!(ctx.query_param("missing").is_none());
    }

    #[test]
    fn test_outbound_takes_precedence_for_query() {
        let mut ctx = RequestCtx::new(
            Method::GET,
            "/path?a=1".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1".into(),
        );
        ctx.outbound = Some("tyk://self/v2?a=2".parse().unwrap());
        assert_eq!(ctx.query_param("a").as_deref(), Some("2"));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(&GatewayError::LoopTargetNotFound);
        assert_eq!(resp.status(), 500);
        let parsed: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(parsed["error"], "Can't detect loop target");
    }
}
