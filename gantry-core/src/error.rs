use thiserror::Error;

/// Unified error type for the Gantry core.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Loop level too deep. Found more than {0} loops in single request")]
    LoopDepthExceeded(u32),

    #[error("Can't detect loop target")]
    LoopTargetNotFound,

    #[error("Failed to perform internal redirect")]
    InternalRedirectFailed,

    #[error("Invalid API descriptor: {0}")]
    DescriptorInvalid(String),

    #[error("Not Found")]
    NotFound,

    #[error("Auth failed: {0}")]
    AuthFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Request is too large")]
    RequestTooLarge,

    #[error("Request validation failed: {0}")]
    ValidationFailed(String),

    #[error("Key has expired, please renew")]
    KeyExpired,

    #[error("Version information not found")]
    VersionNotFound,

    #[error("Template load failure: {0}")]
    TemplateLoad(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound => 404,
            GatewayError::AuthFailed(_) => 401,
            GatewayError::KeyExpired => 401,
            GatewayError::AccessDenied(_) => 403,
            GatewayError::RateLimited => 429,
            GatewayError::QuotaExceeded => 403,
            GatewayError::RequestTooLarge => 413,
            GatewayError::ValidationFailed(_) => 422,
            GatewayError::VersionNotFound => 403,
            GatewayError::Upstream(_) => 502,
            _ => 500,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = self.to_string();
        serde_json::to_vec(&serde_json::json!({ "error": msg, "status": status }))
            .unwrap_or_else(|_| format!(r#"{{"error":"internal","status":{}}}"#, status).into_bytes())
    }
}
