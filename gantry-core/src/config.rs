use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the Gantry gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Default port the gateway listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Dedicated port for the control API. When unset the control API is
    /// mounted on the default listener.
    #[serde(default)]
    pub control_api_port: Option<u16>,

    /// Hostname the control API is scoped to (empty = any host).
    #[serde(default)]
    pub control_api_hostname: String,

    /// Honour per-API custom domains when routing.
    #[serde(default)]
    pub enable_custom_domains: bool,

    /// Enforce exact-prefix-plus-boundary matching on listen paths.
    #[serde(default)]
    pub strict_routes: bool,

    /// Template directory for the GraphQL playground.
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,

    /// Log unmatched requests at the 404 handler.
    #[serde(default)]
    pub track_404_logs: bool,

    /// Enforce per-organisation quotas in the admission block.
    #[serde(default)]
    pub enforce_org_quotas: bool,

    /// OpenTelemetry chain wrapping.
    #[serde(default)]
    pub opentelemetry: OtelConfig,

    /// Legacy distributed-tracing chain wrapping. Takes precedence over
    /// OpenTelemetry; at most one wrapper is applied.
    #[serde(default)]
    pub tracing: TracingConfig,

    /// Slave/RPC operation.
    #[serde(default)]
    pub slave_options: SlaveOptions,

    /// Store hashed rather than raw key identifiers.
    #[serde(default)]
    pub hash_keys: bool,

    /// Disable uptime tests entirely.
    #[serde(default)]
    pub uptime_tests_disabled: bool,

    /// Cloud-hosted mode.
    #[serde(default)]
    pub cloud: bool,

    /// HTTP server behaviour.
    #[serde(default)]
    pub http_server_options: HttpServerOptions,

    /// Root directory custom-middleware bundles are unpacked into.
    #[serde(default = "default_bundle_root")]
    pub bundle_root: PathBuf,

    /// Pattern selecting descriptor strings for key-value indirection.
    #[serde(default = "default_kv_pattern")]
    pub kv_pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveOptions {
    /// Operate against the RPC backbone instead of local stores.
    #[serde(default)]
    pub use_rpc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerOptions {
    /// Read timeout (seconds).
    #[serde(default = "default_http_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout (seconds).
    #[serde(default = "default_http_timeout")]
    pub write_timeout_secs: u64,

    /// Enable HTTP/2 on the listeners.
    #[serde(default = "default_true")]
    pub enable_http2: bool,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_http_timeout(),
            write_timeout_secs: default_http_timeout(),
            enable_http2: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file plus environment overrides
    /// (`GANTRY_LISTEN_PORT`, `GANTRY_SLAVE_OPTIONS__USE_RPC`, ...).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["gantry.yaml", "/etc/gantry/gantry.yaml", "config/gantry.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("GANTRY_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// Port the control API is reachable on.
    pub fn control_port(&self) -> u16 {
        self.control_api_port.unwrap_or(self.listen_port)
    }

    /// Compiled KV-indirection pattern.
    pub fn kv_regex(&self) -> anyhow::Result<regex::Regex> {
        Ok(regex::Regex::new(&self.kv_pattern)?)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            control_api_port: None,
            control_api_hostname: String::new(),
            enable_custom_domains: false,
            strict_routes: false,
            template_path: default_template_path(),
            track_404_logs: false,
            enforce_org_quotas: false,
            opentelemetry: OtelConfig::default(),
            tracing: TracingConfig::default(),
            slave_options: SlaveOptions::default(),
            hash_keys: false,
            uptime_tests_disabled: false,
            cloud: false,
            http_server_options: HttpServerOptions::default(),
            bundle_root: default_bundle_root(),
            kv_pattern: default_kv_pattern(),
        }
    }
}

// Serde default functions

fn default_listen_port() -> u16 {
    8080
}

fn default_template_path() -> PathBuf {
    PathBuf::from("templates")
}

fn default_bundle_root() -> PathBuf {
    PathBuf::from("middleware/bundles")
}

fn default_kv_pattern() -> String {
    r"^(consul|vault|env|secrets)://.+$".to_string()
}

fn default_http_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.control_port(), 8080);
        assert!(!cfg.strict_routes);
        assert!(!cfg.slave_options.use_rpc);
    }

    #[test]
    fn test_control_port_override() {
        let mut cfg = GatewayConfig::default();
        cfg.control_api_port = Some(9090);
        assert_eq!(cfg.control_port(), 9090);
    }

    #[test]
    fn test_kv_pattern_compiles_and_matches() {
        let cfg = GatewayConfig::default();
        let re = cfg.kv_regex().unwrap();
        assert!(re.is_match("env://UPSTREAM_URL"));
        assert!(re.is_match("consul://services/foo"));
        assert!(!re.is_match("http://example.com"));
    }
}
