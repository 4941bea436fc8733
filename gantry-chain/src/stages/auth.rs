use crate::stage::{RequestCtx, Stage, StageOutcome};
use async_trait::async_trait;
use base64::Engine;
use gantry_core::descriptor::ApiDescriptor;
use gantry_core::error::GatewayError;
use gantry_core::session::SessionState;
use gantry_store::StorageHandler;
use std::sync::Arc;
use tracing::debug;

/// Load a session document from a store; None on miss or bad shape.
async fn session_from_store(store: &Arc<dyn StorageHandler>, key: &str) -> Option<SessionState> {
    let raw = store.get_key(key).await.ok()?;
    serde_json::from_str(&raw).ok()
}

fn bearer_token(ctx: &RequestCtx, header: &str) -> Option<String> {
    let value = ctx.header(header)?;
    match value.strip_prefix("Bearer ") {
        Some(token) => Some(token.trim().to_string()),
        None => Some(value.trim().to_string()),
    }
}

/// OAuth2 access-token lookup against the bound auth store.
pub struct OAuthKey {
    spec: Arc<ApiDescriptor>,
    auth_store: Arc<dyn StorageHandler>,
}

impl OAuthKey {
    pub fn new(spec: Arc<ApiDescriptor>, auth_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, auth_store }
    }
}

#[async_trait]
impl Stage for OAuthKey {
    fn name(&self) -> &'static str {
        "oauth-key"
    }

    fn enabled(&self) -> bool {
        self.spec.use_oauth2
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(token) = bearer_token(ctx, &self.spec.auth.auth_header_name) else {
            return StageOutcome::Error(GatewayError::AuthFailed(
                "OAuth authorization field missing".into(),
            ));
        };
        match session_from_store(&self.auth_store, &format!("oauth-{}", token)).await {
            Some(session) => {
                ctx.identity = Some(session);
                StageOutcome::Continue
            }
            None => StageOutcome::Error(GatewayError::AuthFailed(
                "OAuth access token not found".into(),
            )),
        }
    }
}

/// Token issued by an external OAuth provider; introspection is a
/// collaborator, presence and session mapping happen here.
pub struct ExternalOAuth {
    spec: Arc<ApiDescriptor>,
    auth_store: Arc<dyn StorageHandler>,
}

impl ExternalOAuth {
    pub fn new(spec: Arc<ApiDescriptor>, auth_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, auth_store }
    }
}

#[async_trait]
impl Stage for ExternalOAuth {
    fn name(&self) -> &'static str {
        "external-oauth"
    }

    fn enabled(&self) -> bool {
        self.spec.external_oauth.enabled
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(token) = bearer_token(ctx, &self.spec.auth.auth_header_name) else {
            return StageOutcome::Error(GatewayError::AuthFailed("access token missing".into()));
        };
        if let Some(session) =
            session_from_store(&self.auth_store, &format!("ext-oauth-{}", token)).await
        {
            ctx.identity = Some(session);
        } else {
            // Unknown tokens get a synthetic session; validation against the
            // provider happens out-of-process.
            ctx.identity = Some(SessionState {
                key_id: token,
                org_id: self.spec.org_id.clone(),
                ..Default::default()
            });
        }
        StageOutcome::Continue
    }
}

/// RFC 7617 credentials verified against stored bcrypt hashes.
pub struct BasicAuth {
    spec: Arc<ApiDescriptor>,
    auth_store: Arc<dyn StorageHandler>,
}

impl BasicAuth {
    pub fn new(spec: Arc<ApiDescriptor>, auth_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, auth_store }
    }

    fn challenge() -> StageOutcome {
        let resp = http::Response::builder()
            .status(401)
            .header("www-authenticate", "Basic realm=\"gantry\"")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(bytes::Bytes::from_static(
                br#"{"error":"Authorization field missing or malformed","status":401}"#,
            ))
            .unwrap_or_default();
        StageOutcome::Respond(resp)
    }
}

#[async_trait]
impl Stage for BasicAuth {
    fn name(&self) -> &'static str {
        "basic-auth"
    }

    fn enabled(&self) -> bool {
        self.spec.use_basic_auth
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(value) = ctx.header(&self.spec.auth.auth_header_name) else {
            return Self::challenge();
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return Self::challenge();
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return Self::challenge();
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return Self::challenge();
        };
        let Some((user, pass)) = pair.split_once(':') else {
            return Self::challenge();
        };

        let key = format!("basic-{}-{}", self.spec.org_id, user);
        let Some(session) = session_from_store(&self.auth_store, &key).await else {
            return StageOutcome::Error(GatewayError::AuthFailed("user not found".into()));
        };
        let valid = session
            .basic_auth_hash
            .as_deref()
            .map(|hash| bcrypt::verify(pass, hash).unwrap_or(false))
            .unwrap_or(false);
        if !valid {
            return StageOutcome::Error(GatewayError::AuthFailed("password mismatch".into()));
        }
        ctx.identity = Some(session);
        StageOutcome::Continue
    }
}

/// HTTP-signature verification over the `date` header.
pub struct HmacSignature {
    spec: Arc<ApiDescriptor>,
    auth_store: Arc<dyn StorageHandler>,
}

impl HmacSignature {
    pub fn new(spec: Arc<ApiDescriptor>, auth_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, auth_store }
    }
}

#[async_trait]
impl Stage for HmacSignature {
    fn name(&self) -> &'static str {
        "hmac-signature"
    }

    fn enabled(&self) -> bool {
        self.spec.enable_signature_auth
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        use hmac::{Hmac, Mac};

        let Some(value) = ctx.header(&self.spec.auth.auth_header_name) else {
            return StageOutcome::Error(GatewayError::AuthFailed("Signature missing".into()));
        };
        let key_id = extract_field(value, "keyId");
        let signature = extract_field(value, "signature");
        let (Some(key_id), Some(signature)) = (key_id, signature) else {
            return StageOutcome::Error(GatewayError::AuthFailed("Signature malformed".into()));
        };

        let Some(session) = session_from_store(&self.auth_store, &key_id).await else {
            return StageOutcome::Error(GatewayError::AuthFailed("signature key not found".into()));
        };

        let date = ctx.header("date").unwrap_or_default();
        let signing_string = format!("date: {}", date);
        let Ok(mut mac) = Hmac::<sha2::Sha256>::new_from_slice(session.hmac_secret.as_bytes())
        else {
            return StageOutcome::Error(GatewayError::AuthFailed("signature key unusable".into()));
        };
        mac.update(signing_string.as_bytes());
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        if expected != signature {
            return StageOutcome::Error(GatewayError::AuthFailed("signature mismatch".into()));
        }
        ctx.identity = Some(session);
        StageOutcome::Continue
    }
}

fn extract_field(header: &str, field: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let part = part.trim().trim_start_matches("Signature ");
        let (name, value) = part.split_once('=')?;
        (name.trim() == field).then(|| value.trim().trim_matches('"').to_string())
    })
}

/// JWT validation with the descriptor's shared secret.
pub struct Jwt {
    spec: Arc<ApiDescriptor>,
    auth_store: Arc<dyn StorageHandler>,
}

impl Jwt {
    pub fn new(spec: Arc<ApiDescriptor>, auth_store: Arc<dyn StorageHandler>) -> Self {
        Self { spec, auth_store }
    }
}

#[async_trait]
impl Stage for Jwt {
    fn name(&self) -> &'static str {
        "jwt"
    }

    fn enabled(&self) -> bool {
        self.spec.enable_jwt
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(token) = bearer_token(ctx, &self.spec.auth.auth_header_name) else {
            return StageOutcome::Error(GatewayError::AuthFailed("JWT missing".into()));
        };

        let mut validation =
            jsonwebtoken::Validation::new(match self.spec.jwt_signing_method.as_str() {
                "hmac" | "" => jsonwebtoken::Algorithm::HS256,
                "rsa" => jsonwebtoken::Algorithm::RS256,
                "ecdsa" => jsonwebtoken::Algorithm::ES256,
                other => {
                    debug!(method = other, "unknown JWT signing method, defaulting to HS256");
                    jsonwebtoken::Algorithm::HS256
                }
            });
        validation.validate_aud = false;

        let key = jsonwebtoken::DecodingKey::from_secret(self.spec.jwt_source.as_bytes());
        let claims = match jsonwebtoken::decode::<serde_json::Value>(&token, &key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                return StageOutcome::Error(GatewayError::AuthFailed(format!(
                    "JWT validation failed: {}",
                    e
                )));
            }
        };

        let subject = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let session = session_from_store(&self.auth_store, &subject)
            .await
            .unwrap_or_else(|| SessionState {
                key_id: subject,
                org_id: self.spec.org_id.clone(),
                ..Default::default()
            });
        ctx.identity = Some(session);
        StageOutcome::Continue
    }
}

/// OpenID Connect token admission; discovery and issuer checks are a
/// collaborator concern.
pub struct OpenId {
    spec: Arc<ApiDescriptor>,
}

impl OpenId {
    pub fn new(spec: Arc<ApiDescriptor>) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Stage for OpenId {
    fn name(&self) -> &'static str {
        "openid"
    }

    fn enabled(&self) -> bool {
        self.spec.use_openid
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        match bearer_token(ctx, &self.spec.auth.auth_header_name) {
            Some(token) if !token.is_empty() => {
                ctx.identity.get_or_insert_with(|| SessionState {
                    key_id: token,
                    org_id: self.spec.org_id.clone(),
                    ..Default::default()
                });
                StageOutcome::Continue
            }
            _ => StageOutcome::Error(GatewayError::AuthFailed("ID token missing".into())),
        }
    }
}

/// Default token authentication: opaque key looked up in the auth store,
/// by its SHA-256 digest when the gateway hashes keys.
pub struct TokenAuth {
    spec: Arc<ApiDescriptor>,
    auth_store: Arc<dyn StorageHandler>,
    hash_keys: bool,
}

impl TokenAuth {
    pub fn new(
        spec: Arc<ApiDescriptor>,
        auth_store: Arc<dyn StorageHandler>,
        hash_keys: bool,
    ) -> Self {
        Self {
            spec,
            auth_store,
            hash_keys,
        }
    }

    fn storage_key(&self, token: &str) -> String {
        if !self.hash_keys {
            return token.to_string();
        }
        use sha2::Digest;
        let digest = sha2::Sha256::digest(token.as_bytes());
        digest.iter().fold(String::new(), |mut out, b| {
            use std::fmt::Write;
            let _ = write!(out, "{:02x}", b);
            out
        })
    }
}

#[async_trait]
impl Stage for TokenAuth {
    fn name(&self) -> &'static str {
        "token-auth"
    }

    async fn handle(&self, ctx: &mut RequestCtx) -> StageOutcome {
        let Some(token) = bearer_token(ctx, &self.spec.auth.auth_header_name) else {
            return StageOutcome::Error(GatewayError::AuthFailed(
                "Authorization field missing".into(),
            ));
        };
        if token.is_empty() {
            return StageOutcome::Error(GatewayError::AuthFailed(
                "Authorization field missing".into(),
            ));
        }
        match session_from_store(&self.auth_store, &self.storage_key(&token)).await {
            Some(session) => {
                ctx.identity = Some(session);
                StageOutcome::Continue
            }
            None => StageOutcome::Error(GatewayError::AuthFailed("Key not authorised".into())),
        }
    }
}
