pub mod config;
pub mod descriptor;
pub mod error;
pub mod session;

/// Reserved URL scheme that re-enters the gateway instead of leaving it.
pub const LOOP_SCHEME: &str = "tyk";

/// Host literal that targets the current API's own chain.
pub const LOOP_SELF_HOST: &str = "self";

/// Synthetic sub-endpoint mounted under every authenticated listen path.
pub const RATE_LIMIT_SUFFIX: &str = "/tyk/rate-limits/";

/// Query parameter that overrides the HTTP method on an internal hop.
pub const LOOP_METHOD_PARAM: &str = "method";

/// Query parameter that overrides the per-request loop depth cap.
pub const LOOP_LIMIT_PARAM: &str = "loop_limit";

/// Query parameter that enables quota accounting on the inner hop.
pub const LOOP_CHECK_LIMITS_PARAM: &str = "check_limits";

/// Default per-request loop depth cap.
pub const DEFAULT_LOOP_LIMIT: u32 = 5;

/// Request-context key consumed by the loop dispatcher: a URL-rewrite stage
/// stores the rewritten target here for the next internal hop.
pub const CTX_URL_REWRITE_TARGET: &str = "url_rewrite_target";

/// Request-context key consumed by the loop dispatcher: a method-transform
/// stage stores the replacement method here for the next internal hop.
pub const CTX_TRANSFORM_METHOD: &str = "transform_request_method";

/// Key-value lookup indirection for descriptor strings.
///
/// Strings matching the configured pattern (see
/// [`config::GatewayConfig::kv_pattern`]) are handed to this collaborator
/// before use; a resolver miss passes the original string through unchanged.
pub trait KvResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<String>;
}

/// Resolve `raw` through the KV collaborator when it matches `pattern`.
pub fn resolve_indirect(raw: &str, pattern: &regex::Regex, kv: Option<&dyn KvResolver>) -> String {
    if !pattern.is_match(raw) {
        return raw.to_string();
    }
    match kv.and_then(|r| r.resolve(raw)) {
        Some(resolved) => resolved,
        None => raw.to_string(),
    }
}
