use gantry_chain::chain::{ApiChain, Chain};
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::{ApiDescriptor, Protocol};
use gantry_core::RATE_LIMIT_SUFFIX;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Listener identity a router is keyed by. HTTP-family protocols share one
/// router per port; TLS termination is a listener concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl ListenKey {
    pub fn http(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Http,
        }
    }

    fn for_spec(spec: &ApiDescriptor, config: &GatewayConfig) -> Self {
        let protocol = if spec.is_http_family() {
            Protocol::Http
        } else {
            spec.protocol
        };
        Self {
            port: spec.effective_port(config),
            protocol,
        }
    }
}

/// What a matched route dispatches into.
#[derive(Clone)]
pub enum Endpoint {
    Chain(Arc<ApiChain>),
    SideChain(Arc<Chain>),
    Control,
    /// Explicit 404 mount (the synthetic endpoint of an open API).
    NotFound,
}

/// Outcome of a lookup on the router set.
pub enum Resolution {
    Matched(Endpoint),
    /// A strict-prefix entry matched but the boundary check failed.
    GateMiss,
    NoRoute,
    NoRouter,
}

enum PrefixPattern {
    /// Raw string prefix.
    Plain,
    /// Segment-wise match; `{…}` segments match any one path segment.
    Segments(Vec<Segment>),
}

enum Segment {
    Literal(String),
    Param,
}

struct RouteEntry {
    /// Exact hostname constraint (lowercase, portless); None matches any.
    host: Option<String>,
    prefix: String,
    pattern: PrefixPattern,
    /// Strict-prefix gate armed for this entry.
    strict: bool,
    endpoint: Endpoint,
}

impl RouteEntry {
    fn new(host: Option<String>, prefix: String, strict_routes: bool, endpoint: Endpoint) -> Self {
        let parametric = prefix.contains('{');
        let pattern = if parametric {
            PrefixPattern::Segments(
                prefix
                    .split('/')
                    .map(|seg| {
                        if seg.starts_with('{') && seg.ends_with('}') && seg.len() >= 2 {
                            Segment::Param
                        } else {
                            Segment::Literal(seg.to_string())
                        }
                    })
                    .collect(),
            )
        } else {
            PrefixPattern::Plain
        };
        // The gate is bypassed for `/`-terminated and parametric prefixes.
        let strict = strict_routes && !prefix.ends_with('/') && !parametric;
        Self {
            host,
            prefix,
            pattern,
            strict,
            endpoint,
        }
    }

    fn host_matches(&self, request_host: Option<&str>) -> bool {
        match &self.host {
            None => true,
            Some(expected) => match request_host {
                Some(host) => {
                    let host = host.split(':').next().unwrap_or(host);
                    host.eq_ignore_ascii_case(expected)
                }
                None => false,
            },
        }
    }

    /// None = no match; Some(true) = reaches the endpoint; Some(false) =
    /// gate miss.
    fn path_matches(&self, path: &str) -> Option<bool> {
        match &self.pattern {
            PrefixPattern::Plain => {
                if !path.starts_with(&self.prefix) {
                    return None;
                }
                if !self.strict {
                    return Some(true);
                }
                let boundary = path.len() == self.prefix.len()
                    || path.as_bytes().get(self.prefix.len()) == Some(&b'/');
                Some(boundary)
            }
            PrefixPattern::Segments(segments) => {
                let mut path_segs = path.split('/');
                for seg in segments {
                    let Some(actual) = path_segs.next() else {
                        return None;
                    };
                    match seg {
                        Segment::Param => {
                            if actual.is_empty() {
                                return None;
                            }
                        }
                        Segment::Literal(expected) => {
                            if actual != expected {
                                return None;
                            }
                        }
                    }
                }
                Some(true)
            }
        }
    }
}

/// Ordered prefix router for one listener. Entries are scanned in
/// registration order, so the loader's descriptor sort decides priority.
#[derive(Default)]
pub struct PathRouter {
    entries: Vec<RouteEntry>,
}

impl PathRouter {
    pub fn add(
        &mut self,
        host: Option<String>,
        prefix: String,
        strict_routes: bool,
        endpoint: Endpoint,
    ) {
        self.entries
            .push(RouteEntry::new(host, prefix, strict_routes, endpoint));
    }

    pub fn resolve(&self, host: Option<&str>, path: &str) -> Resolution {
        for entry in &self.entries {
            if !entry.host_matches(host) {
                continue;
            }
            match entry.path_matches(path) {
                Some(true) => return Resolution::Matched(entry.endpoint.clone()),
                Some(false) => return Resolution::GateMiss,
                None => {}
            }
        }
        Resolution::NoRoute
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The full routing table: one `PathRouter` per listener, swapped wholesale
/// on every reload.
#[derive(Default)]
pub struct RouterSet {
    routers: HashMap<ListenKey, PathRouter>,
}

impl RouterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports are initialised lazily on first registration.
    fn router_mut(&mut self, key: ListenKey) -> &mut PathRouter {
        self.routers.entry(key).or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ListenKey> {
        self.routers.keys()
    }

    pub fn router(&self, key: &ListenKey) -> Option<&PathRouter> {
        self.routers.get(key)
    }

    pub fn resolve(&self, key: ListenKey, host: Option<&str>, path: &str) -> Resolution {
        match self.routers.get(&key) {
            Some(router) => router.resolve(host, path),
            None => Resolution::NoRouter,
        }
    }

    /// Pre-mount the control-API routes on the management port.
    pub fn mount_control(&mut self, config: &GatewayConfig) {
        let host = if config.control_api_hostname.is_empty() {
            None
        } else {
            Some(config.control_api_hostname.to_ascii_lowercase())
        };
        let router = self.router_mut(ListenKey::http(config.control_port()));
        router.add(host.clone(), "/hello".to_string(), false, Endpoint::Control);
        router.add(host, "/tyk/".to_string(), false, Endpoint::Control);
    }

    /// Register one API's routes: the `/<api_id>/` prefix and the declared
    /// listen path, each with the rate-limit side-chain (when present)
    /// mounted above the catch-all.
    pub fn register_api(
        &mut self,
        config: &GatewayConfig,
        spec: &ApiDescriptor,
        chain: &Arc<ApiChain>,
    ) {
        let key = ListenKey::for_spec(spec, config);
        let domain = spec.effective_domain(config);
        let host = if domain.is_empty() {
            None
        } else {
            Some(domain.to_ascii_lowercase())
        };
        let router = self.router_mut(key);

        for prefix in [format!("/{}/", spec.api_id), spec.listen_path.clone()] {
            let side_path = format!("{}{}", prefix.trim_end_matches('/'), RATE_LIMIT_SUFFIX);
            let side_endpoint = match &chain.rate_limit_handler {
                Some(side) => Endpoint::SideChain(side.clone()),
                // Open APIs have no live counters to report.
                None => Endpoint::NotFound,
            };
            router.add(host.clone(), side_path, config.strict_routes, side_endpoint);
            router.add(
                host.clone(),
                prefix,
                config.strict_routes,
                Endpoint::Chain(chain.clone()),
            );
        }

        debug!(api_id = %spec.api_id, port = key.port, listen_path = %spec.listen_path, "API registered");
    }
}
