use bytes::Bytes;
use gantry_chain::stage::json_response;
use http::{Method, Response};

/// Minimal control surface pre-mounted on the management port. The full
/// control-plane API lives outside the core; only the liveness probe is
/// served here.
pub fn handle(method: &Method, path: &str) -> Response<Bytes> {
    match (method, path) {
        (&Method::GET, "/hello") | (&Method::GET, "/tyk/hello") => json_response(
            200,
            serde_json::json!({
                "status": "pass",
                "version": env!("CARGO_PKG_VERSION"),
                "description": "gantry gateway",
            }),
        ),
        _ => json_response(
            404,
            serde_json::json!({ "error": "Not Found", "status": 404 }),
        ),
    }
}
