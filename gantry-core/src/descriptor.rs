use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::KvResolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// TLS 1.2 wire constant — the ceiling every descriptor's `ssl_max_version`
/// is clamped to.
pub const TLS12: u16 = 771;

/// An API route's declared configuration as consumed by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDescriptor {
    /// Internal object id (generated when absent).
    #[serde(default)]
    pub id: String,

    /// Stable API identifier.
    pub api_id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub org_id: String,

    #[serde(default)]
    pub protocol: Protocol,

    /// Listener port (None = gateway default).
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Custom domain; empty matches any host.
    #[serde(default)]
    pub domain: String,

    /// URL prefix the chain is mounted under.
    #[serde(default)]
    pub listen_path: String,

    /// Upstream base URL.
    #[serde(default)]
    pub target_url: String,

    // ── Authentication flags ──
    #[serde(default)]
    pub use_keyless: bool,

    #[serde(default)]
    pub use_standard_auth: bool,

    #[serde(default)]
    pub use_oauth2: bool,

    #[serde(default)]
    pub external_oauth: ExternalOAuthSection,

    #[serde(default)]
    pub use_basic_auth: bool,

    #[serde(default)]
    pub enable_signature_auth: bool,

    #[serde(default)]
    pub enable_jwt: bool,

    /// Shared secret or key material for JWT validation.
    #[serde(default)]
    pub jwt_source: String,

    #[serde(default)]
    pub jwt_signing_method: String,

    #[serde(default)]
    pub use_openid: bool,

    #[serde(default)]
    pub use_custom_plugin_auth: bool,

    #[serde(default)]
    pub auth: AuthSection,

    #[serde(default)]
    pub version_data: VersionData,

    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub custom_middleware: MiddlewareSection,

    /// TLS wire versions (0 = unset).
    #[serde(default)]
    pub ssl_min_version: u16,

    #[serde(default)]
    pub ssl_max_version: u16,

    /// Header names copied into analytics tags; lowercased at normalisation.
    #[serde(default)]
    pub tag_headers: Vec<String>,

    // ── Feature toggles ──
    /// Routable only through the loop dispatcher.
    #[serde(default)]
    pub internal: bool,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub enable_batch_request_support: bool,

    #[serde(default)]
    pub graphql: GraphQLSection,

    #[serde(default)]
    pub analytics_plugin: AnalyticsPluginSection,

    #[serde(default)]
    pub use_mutual_tls_auth: bool,

    #[serde(default)]
    pub enable_context_vars: bool,

    #[serde(default)]
    pub enable_ip_whitelisting: bool,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default)]
    pub enable_ip_blacklisting: bool,

    #[serde(default)]
    pub blacklisted_ips: Vec<String>,

    /// Maximum request body size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_request_size: i64,

    #[serde(default)]
    pub enable_detailed_recording: bool,

    #[serde(default)]
    pub do_not_track: bool,

    #[serde(default)]
    pub tracked_endpoints: Vec<String>,

    #[serde(default)]
    pub cache_options: CacheOptions,

    #[serde(default)]
    pub cors: CorsSection,

    /// Declared to be in the OpenAPI-extended shape.
    #[serde(default)]
    pub is_oas: bool,

    /// The gateway extension document carried by OAS-shaped descriptors.
    #[serde(default)]
    pub oas_extension: Option<serde_json::Value>,

    #[serde(default)]
    pub upstream_auth: UpstreamAuthSection,

    #[serde(default)]
    pub request_signing: RequestSigningSection,

    #[serde(default)]
    pub global_rate_limit: GlobalRateLimitSection,

    #[serde(default)]
    pub strip_auth_data: bool,

    /// TTL applied to session write-backs, in seconds (0 = no expiry).
    #[serde(default)]
    pub session_lifetime: i64,

    #[serde(default)]
    pub auth_provider: ProviderMeta,

    #[serde(default)]
    pub session_provider: ProviderMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "")]
    Empty,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "https")]
    Https,
    #[serde(rename = "h2c")]
    H2c,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tls")]
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Empty => "",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::H2c => "h2c",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalOAuthSection {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_auth_header")]
    pub auth_header_name: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            auth_header_name: default_auth_header(),
        }
    }
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

/// Versioning block. `versions` maps a version name to its metadata; a
/// version may reference a child descriptor by `api_id` (re-linked by the
/// loader after registration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionData {
    #[serde(default = "default_true")]
    pub not_versioned: bool,

    #[serde(default)]
    pub default_version: String,

    #[serde(default)]
    pub versions: HashMap<String, VersionInfo>,

    /// Set by the loader on version children; cleared before every reload.
    #[serde(default)]
    pub base_api_id: Option<String>,
}

impl Default for VersionData {
    fn default() -> Self {
        Self {
            not_versioned: true,
            default_version: String::new(),
            versions: HashMap::new(),
            base_api_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub override_target: Option<String>,

    /// Child descriptor reference.
    #[serde(default)]
    pub api_id: Option<String>,

    #[serde(default)]
    pub extended_paths: ExtendedPaths,
}

/// Per-endpoint behaviour declared under a version. Presence of entries
/// drives stage enablement in the composer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedPaths {
    #[serde(default)]
    pub mock_response: Vec<MockMeta>,

    #[serde(default)]
    pub virtual_endpoints: Vec<VirtualMeta>,

    /// Cached paths.
    #[serde(default)]
    pub cache: Vec<String>,

    #[serde(default)]
    pub transform: Vec<TransformMeta>,

    #[serde(default)]
    pub transform_jq: Vec<JqMeta>,

    #[serde(default)]
    pub transform_headers: Vec<HeaderTransformMeta>,

    #[serde(default)]
    pub url_rewrites: Vec<UrlRewriteMeta>,

    #[serde(default)]
    pub method_transforms: Vec<MethodTransformMeta>,

    #[serde(default)]
    pub validate_json: Vec<ValidateJsonMeta>,

    #[serde(default)]
    pub validate_request: Vec<ValidateRequestMeta>,

    #[serde(default)]
    pub persist_graphql: Vec<PersistGraphqlMeta>,
}

impl ExtendedPaths {
    pub fn is_empty(&self) -> bool {
        self.mock_response.is_empty()
            && self.virtual_endpoints.is_empty()
            && self.cache.is_empty()
            && self.transform.is_empty()
            && self.transform_jq.is_empty()
            && self.transform_headers.is_empty()
            && self.url_rewrites.is_empty()
            && self.method_transforms.is_empty()
            && self.validate_json.is_empty()
            && self.validate_request.is_empty()
            && self.persist_graphql.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub response_function_name: String,
    #[serde(default)]
    pub function_source_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JqMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderTransformMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub add_headers: HashMap<String, String>,
    #[serde(default)]
    pub delete_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UrlRewriteMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub match_pattern: String,
    #[serde(default)]
    pub rewrite_to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodTransformMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub to_method: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateJsonMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateRequestMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistGraphqlMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub variables: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub enable_load_balancing: bool,

    #[serde(default)]
    pub target_list: Vec<String>,

    /// Strip the matched listen path before proxying upstream.
    #[serde(default)]
    pub strip_listen_path: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareSection {
    #[serde(default)]
    pub pre: Vec<HookDef>,

    #[serde(default)]
    pub post_key_auth: Vec<HookDef>,

    #[serde(default)]
    pub post: Vec<HookDef>,

    #[serde(default)]
    pub response: Vec<HookDef>,

    #[serde(default)]
    pub auth_check: Option<HookDef>,

    #[serde(default)]
    pub driver: Driver,

    /// Bundle archive name; when set, native-plugin hook paths are rewritten
    /// under the unpacked bundle root.
    #[serde(default)]
    pub bundle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookDef {
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub symbol_name: String,

    #[serde(default)]
    pub raw_body_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    GoPlugin,
    #[default]
    Otto,
    Coprocess,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub max_query_depth: i64,

    #[serde(default)]
    pub playground: PlaygroundSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaygroundSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsPluginSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub plugin_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    #[serde(default)]
    pub enable_cache: bool,

    /// Seconds.
    #[serde(default)]
    pub cache_timeout: u64,

    #[serde(default)]
    pub cache_all_safe_requests: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorsSection {
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allowed_methods: Vec<String>,

    #[serde(default)]
    pub allowed_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamAuthSection {
    #[serde(default)]
    pub basic_auth: UpstreamBasicAuth,

    #[serde(default)]
    pub oauth: UpstreamOAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamBasicAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub header_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub token_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSigningSection {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub algorithm: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalRateLimitSection {
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub per: f64,
}

/// Auth/session provider selection consumed by the store binder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMeta {
    #[serde(default)]
    pub name: String,

    /// `""`, `"ldap"`, or `"rpc"`.
    #[serde(default)]
    pub storage_engine: String,

    #[serde(default)]
    pub meta: serde_json::Value,
}

impl ApiDescriptor {
    /// Whether this descriptor terminates HTTP-family traffic.
    pub fn is_http_family(&self) -> bool {
        matches!(
            self.protocol,
            Protocol::Empty | Protocol::Http | Protocol::Https | Protocol::H2c
        )
    }

    pub fn is_tcp_family(&self) -> bool {
        matches!(self.protocol, Protocol::Tcp | Protocol::Tls)
    }

    /// Whether the chain requires an authentication block.
    pub fn authenticated(&self) -> bool {
        !self.use_keyless
    }

    pub fn effective_port(&self, config: &GatewayConfig) -> u16 {
        self.listen_port.unwrap_or(config.listen_port)
    }

    /// Domain used for routing; custom domains can be globally disabled.
    pub fn effective_domain(&self, config: &GatewayConfig) -> &str {
        if config.enable_custom_domains {
            &self.domain
        } else {
            ""
        }
    }

    /// Arbitration key: `hostname||listen_path`.
    pub fn collision_key(&self, config: &GatewayConfig) -> String {
        format!("{}{}", self.effective_domain(config), self.listen_path)
    }

    /// Backfill generated fields and normalise declared ones.
    pub fn normalise(&mut self, config: &GatewayConfig, kv: Option<&dyn KvResolver>) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }

        for header in &mut self.tag_headers {
            *header = header.to_ascii_lowercase();
        }

        // TLS clamp: max lands on TLS 1.2, then is raised to min if inverted.
        if self.ssl_max_version != 0 {
            self.ssl_max_version = TLS12;
        }
        if self.ssl_max_version != 0 && self.ssl_min_version > self.ssl_max_version {
            self.ssl_max_version = self.ssl_min_version;
        }

        if let Ok(pattern) = config.kv_regex() {
            self.target_url = crate::resolve_indirect(&self.target_url, &pattern, kv);
        }
    }

    /// Reject malformed descriptors. HTTP-family descriptors need a
    /// prefix-shaped listen path and a parseable target URL.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !self.is_http_family() {
            return Ok(());
        }

        if self.listen_path.is_empty() {
            return Err(GatewayError::DescriptorInvalid(
                "listen path is empty".into(),
            ));
        }
        if self.listen_path.contains(char::is_whitespace) {
            return Err(GatewayError::DescriptorInvalid(
                "listen path contains spaces".into(),
            ));
        }

        let uri: http::Uri = self.target_url.parse().map_err(|e| {
            GatewayError::DescriptorInvalid(format!("target URL does not parse: {}", e))
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(GatewayError::DescriptorInvalid(
                "target URL has no scheme or host".into(),
            ));
        }

        Ok(())
    }

    /// Equality predicate for chain reuse across reloads. The loader-managed
    /// version link is excluded so re-linking does not defeat reuse.
    pub fn same_definition(&self, other: &ApiDescriptor) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.version_data.base_api_id = None;
        b.version_data.base_api_id = None;
        a == b
    }

    /// Effective listen-path length used as the registration sort key.
    pub fn listen_path_length(&self) -> usize {
        effective_path_length(&self.listen_path)
    }

    /// Canonical name for loop-target matching: drop everything from one
    /// character before the first `#` onward, keep alphanumerics, lowercase.
    pub fn loop_name(&self) -> String {
        canonical_loop_name(&self.name)
    }

    /// Whether versioning contributes a multi-target sink: enabled
    /// versioning plus at least one override target.
    pub fn has_version_overrides(&self) -> bool {
        !self.version_data.not_versioned
            && self
                .version_data
                .versions
                .values()
                .any(|v| v.override_target.as_deref().is_some_and(|t| !t.is_empty()))
    }

    /// Union of a predicate over every version's extended paths.
    pub fn any_version<F: Fn(&ExtendedPaths) -> bool>(&self, pred: F) -> bool {
        self.version_data
            .versions
            .values()
            .any(|v| pred(&v.extended_paths))
    }
}

/// Sort key: count of `/` plus the literal segment lengths; `{…}` segments
/// contribute only their slash.
pub fn effective_path_length(path: &str) -> usize {
    let slashes = path.matches('/').count();
    let literal: usize = path
        .split('/')
        .filter(|seg| !(seg.starts_with('{') && seg.ends_with('}') && seg.len() >= 2))
        .map(|seg| seg.len())
        .sum();
    slashes + literal
}

/// Order descriptors for registration: empty-domain descriptors last, and
/// within each group the longer effective listen path first. The sort is
/// stable.
pub fn sort_descriptors(specs: &mut [ApiDescriptor]) {
    specs.sort_by(|a, b| {
        use std::cmp::Ordering;
        match (a.domain.is_empty(), b.domain.is_empty()) {
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
            _ => b.listen_path_length().cmp(&a.listen_path_length()),
        }
    });
}

/// See [`ApiDescriptor::loop_name`]. The character immediately before the
/// `#` is consumed together with the marker.
pub fn canonical_loop_name(name: &str) -> String {
    let base = match name.find('#') {
        Some(pos) => {
            let head = &name[..pos];
            match head.char_indices().last() {
                Some((i, _)) => &head[..i],
                None => head,
            }
        }
        None => name,
    };
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(api_id: &str, path: &str) -> ApiDescriptor {
        serde_json::from_value(serde_json::json!({
            "api_id": api_id,
            "name": api_id,
            "listen_path": path,
            "target_url": "http://upstream.local:8080",
        }))
        .unwrap()
    }

    #[test]
    fn test_deserialize_minimal() {
        let d = minimal("a1", "/a1/");
        assert_eq!(d.api_id, "a1");
        assert!(d.is_http_family());
        assert!(d.version_data.not_versioned);
        assert!(d.active);
    }

    #[test]
    fn test_validate_rejects_empty_and_spaced_paths() {
        let mut d = minimal("a1", "");
        assert!(d.validate().is_err());
        d.listen_path = "/with space/".into();
        assert!(d.validate().is_err());
        d.listen_path = "/ok/".into();
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        let mut d = minimal("a1", "/a1/");
        d.target_url = "http://exa mple".into();
        assert!(d.validate().is_err());
        d.target_url = "no-scheme".into();
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_validate_skips_tcp() {
        let mut d = minimal("t1", "");
        d.protocol = Protocol::Tcp;
        d.target_url = String::new();
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_tls_clamp() {
        let cfg = GatewayConfig::default();
        let mut d = minimal("a1", "/a1/");
        d.ssl_max_version = 772;
        d.normalise(&cfg, None);
        assert_eq!(d.ssl_max_version, TLS12);

        let mut d = minimal("a2", "/a2/");
        d.ssl_min_version = 770;
        d.ssl_max_version = 769;
        d.normalise(&cfg, None);
        assert!(d.ssl_min_version <= d.ssl_max_version);

        let mut d = minimal("a3", "/a3/");
        d.normalise(&cfg, None);
        assert_eq!(d.ssl_max_version, 0);
    }

    #[test]
    fn test_tag_headers_lowercased() {
        let cfg = GatewayConfig::default();
        let mut d = minimal("a1", "/a1/");
        d.tag_headers = vec!["X-Team".into(), "X-REGION".into()];
        d.normalise(&cfg, None);
        assert_eq!(d.tag_headers, vec!["x-team", "x-region"]);
    }

    #[test]
    fn test_effective_path_length() {
        assert_eq!(effective_path_length("/foo"), 4);
        assert_eq!(effective_path_length("/foo-bar"), 8);
        assert!(effective_path_length("/foo-bar") > effective_path_length("/foo"));
        // `{…}` segments contribute only their slash.
        assert_eq!(effective_path_length("/{x}/foo"), 5);
        assert_eq!(effective_path_length("/{version}/foo"), 5);
        // Invariant under reordering adjacent static segments.
        assert_eq!(
            effective_path_length("/a/bb/ccc"),
            effective_path_length("/ccc/a/bb")
        );
    }

    #[test]
    fn test_sort_empty_domain_last_longer_path_first() {
        let mut a = minimal("a", "/foo");
        a.domain = "api.example.com".into();
        let b = minimal("b", "/foo-bar");
        let c = minimal("c", "/foo");
        let mut specs = vec![c.clone(), b.clone(), a.clone()];
        sort_descriptors(&mut specs);
        assert_eq!(specs[0].api_id, "a");
        assert_eq!(specs[1].api_id, "b");
        assert_eq!(specs[2].api_id, "c");
    }

    #[test]
    fn test_sort_is_stable() {
        let mut specs = vec![minimal("x", "/same"), minimal("y", "/same")];
        sort_descriptors(&mut specs);
        assert_eq!(specs[0].api_id, "x");
        assert_eq!(specs[1].api_id, "y");
    }

    #[test]
    fn test_canonical_loop_name_category_trim() {
        // The character before the '#' goes with it.
        assert_eq!(canonical_loop_name("foo #bar"), "foo");
        assert_eq!(canonical_loop_name("foo#bar"), "fo");
        assert_eq!(canonical_loop_name("My API"), "myapi");
        assert_eq!(canonical_loop_name("Orders-v2"), "ordersv2");
        assert_eq!(canonical_loop_name("#tag"), "");
    }

    #[test]
    fn test_same_definition_ignores_base_link() {
        let a = minimal("a", "/a/");
        let mut b = a.clone();
        b.version_data.base_api_id = Some("parent".into());
        assert!(a.same_definition(&b));
        b.listen_path = "/other/".into();
        assert!(!a.same_definition(&b));
    }

    #[test]
    fn test_version_overrides() {
        let mut d = minimal("a", "/a/");
        assert!(!d.has_version_overrides());
        d.version_data.not_versioned = false;
        d.version_data.versions.insert(
            "v2".into(),
            VersionInfo {
                override_target: Some("http://v2.local".into()),
                ..Default::default()
            },
        );
        assert!(d.has_version_overrides());
    }
}
