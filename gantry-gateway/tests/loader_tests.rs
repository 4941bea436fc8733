use gantry_chain::stages::custom::NullDriverHost;
use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::ApiDescriptor;
use gantry_gateway::loader::{ApiLoader, LoadReport, UnloadHook};
use gantry_gateway::mux::{Endpoint, ListenKey, Resolution};
use gantry_store::binder::AmbientStores;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn loader() -> ApiLoader {
    loader_with(GatewayConfig::default())
}

fn loader_with(config: GatewayConfig) -> ApiLoader {
    ApiLoader::new(
        Arc::new(config),
        AmbientStores::in_memory(),
        Arc::new(NullDriverHost),
    )
}

fn spec(api_id: &str, path: &str) -> ApiDescriptor {
    serde_json::from_value(serde_json::json!({
        "api_id": api_id,
        "name": api_id,
        "listen_path": path,
        "target_url": "http://upstream.local:9000",
    }))
    .unwrap()
}

fn key() -> ListenKey {
    ListenKey::http(GatewayConfig::default().listen_port)
}

#[test]
fn empty_set_leaves_only_control_route() {
    let loader = loader();
    let report = loader.load(vec![]);
    assert_eq!(report, LoadReport::default());

    assert!(matches!(
        loader.resolve(key(), None, "/hello"),
        Resolution::Matched(Endpoint::Control)
    ));
    assert!(matches!(
        loader.resolve(key(), None, "/anything"),
        Resolution::NoRoute
    ));
}

#[test]
fn collision_exactly_one_keeps_path_and_assignment_is_stable() {
    let loader = loader();
    loader.load(vec![spec("a", "/x"), spec("b", "/x")]);

    let a_path = loader.descriptor_for("a").unwrap().listen_path.clone();
    let b_path = loader.descriptor_for("b").unwrap().listen_path.clone();
    assert_ne!(a_path, b_path, "registered paths must differ");
    assert!(a_path == "/x" || b_path == "/x", "exactly one keeps /x");
    let suffixed = if a_path == "/x" { &b_path } else { &a_path };
    assert!(suffixed.starts_with("/x-"), "loser is suffixed: {}", suffixed);

    // A second identical load reproduces the same assignment.
    let report = loader.load(vec![spec("a", "/x"), spec("b", "/x")]);
    assert_eq!(report.unloaded, 0, "stable reload unloads nothing");
    assert_eq!(loader.descriptor_for("a").unwrap().listen_path, a_path);
    assert_eq!(loader.descriptor_for("b").unwrap().listen_path, b_path);
}

#[test]
fn suffix_cascade_yields_pairwise_distinct_paths() {
    let loader = loader();
    loader.load(vec![spec("a", "/x"), spec("b", "/x"), spec("c", "/x-a")]);

    let mut paths: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|id| loader.descriptor_for(id).unwrap().listen_path.clone())
        .collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3, "paths must be pairwise distinct: {:?}", paths);
}

#[test]
fn identical_reload_reuses_chain_objects() {
    let loader = loader();
    loader.load(vec![spec("a", "/a/")]);
    let first = loader.chain_for("a").unwrap();

    loader.load(vec![spec("a", "/a/")]);
    let second = loader.chain_for("a").unwrap();
    assert!(
        Arc::ptr_eq(&first, &second),
        "unchanged descriptor keeps its chain object"
    );

    // A changed descriptor gets a fresh chain and the old one is unloaded.
    let mut changed = spec("a", "/a/");
    changed.target_url = "http://elsewhere.local:9000".into();
    let report = loader.load(vec![changed]);
    assert_eq!(report.unloaded, 1);
    let third = loader.chain_for("a").unwrap();
    assert!(!Arc::ptr_eq(&second, &third));
}

#[test]
fn keyless_api_has_no_rate_limit_endpoint() {
    let loader = loader();
    let mut open = spec("open", "/open");
    open.use_keyless = true;
    loader.load(vec![open]);

    match loader.resolve(key(), None, "/open/anything") {
        Resolution::Matched(Endpoint::Chain(chain)) => {
            assert!(chain.open);
            assert!(chain.rate_limit_handler.is_none());
        }
        _ => panic!("open API must be reachable"),
    }
    assert!(matches!(
        loader.resolve(key(), None, "/open/tyk/rate-limits/"),
        Resolution::Matched(Endpoint::NotFound)
    ));
}

#[test]
fn authenticated_api_mounts_rate_limit_side_chain() {
    let loader = loader();
    loader.load(vec![spec("auth", "/auth")]);

    assert!(matches!(
        loader.resolve(key(), None, "/auth/tyk/rate-limits/"),
        Resolution::Matched(Endpoint::SideChain(_))
    ));
    assert!(matches!(
        loader.resolve(key(), None, "/auth/tyk/rate-limits/extra"),
        Resolution::Matched(Endpoint::SideChain(_))
    ));
    assert!(matches!(
        loader.resolve(key(), None, "/auth/other"),
        Resolution::Matched(Endpoint::Chain(_))
    ));
    // The `/<api_id>/` alias carries the side chain too.
    assert!(matches!(
        loader.resolve(key(), None, "/auth/tyk/rate-limits/"),
        Resolution::Matched(Endpoint::SideChain(_))
    ));
}

#[test]
fn strict_routes_gate() {
    let config = GatewayConfig {
        strict_routes: true,
        ..Default::default()
    };
    let loader = loader_with(config);
    let mut open = spec("foo", "/foo");
    open.use_keyless = true;
    loader.load(vec![open]);

    assert!(matches!(
        loader.resolve(key(), None, "/foo"),
        Resolution::Matched(Endpoint::Chain(_))
    ));
    assert!(matches!(
        loader.resolve(key(), None, "/foo/x"),
        Resolution::Matched(Endpoint::Chain(_))
    ));
    assert!(matches!(
        loader.resolve(key(), None, "/foobar"),
        Resolution::GateMiss
    ));
}

#[test]
fn trailing_slash_listen_path_disables_gate() {
    let config = GatewayConfig {
        strict_routes: true,
        ..Default::default()
    };
    let loader = loader_with(config);
    let mut open = spec("foo", "/foo/");
    open.use_keyless = true;
    loader.load(vec![open]);

    assert!(matches!(
        loader.resolve(key(), None, "/foo/x"),
        Resolution::Matched(Endpoint::Chain(_))
    ));
}

#[test]
fn internal_descriptor_skips_registry_but_keeps_chain() {
    let loader = loader();
    let mut inner = spec("inner", "/inner/");
    inner.internal = true;
    inner.name = "Inner Service".into();
    let report = loader.load(vec![inner]);
    assert_eq!(report.skipped, 1);

    assert!(matches!(
        loader.resolve(key(), None, "/inner/x"),
        Resolution::NoRoute
    ));
    let chain = loader.chain_for("inner").unwrap();
    assert!(chain.skip);
    // Reachable through the loop dispatcher by canonical name.
    assert!(loader.loop_engine().find_target("innerservice").is_some());
}

#[test]
fn invalid_descriptor_is_skipped_but_not_dropped() {
    let loader = loader();
    let bad = spec("bad", "/has space/");
    let good = spec("good", "/good/");
    let report = loader.load(vec![bad, good]);
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped, 1);

    assert!(matches!(
        loader.resolve(key(), None, "/has space/x"),
        Resolution::NoRoute
    ));
    // Kept in the chain table so reloads do not oscillate.
    assert!(loader.chain_for("bad").unwrap().skip);
    let report = loader.load(vec![spec("bad", "/has space/"), spec("good", "/good/")]);
    assert_eq!(report.unloaded, 0);
}

#[test]
fn domain_scoped_apis_route_by_host() {
    let config = GatewayConfig {
        enable_custom_domains: true,
        ..Default::default()
    };
    let loader = loader_with(config);
    let mut hosted = spec("hosted", "/svc");
    hosted.domain = "api.example.com".into();
    hosted.use_keyless = true;
    let mut anyhost = spec("anyhost", "/svc");
    anyhost.use_keyless = true;
    loader.load(vec![hosted, anyhost]);

    // Same listen path on different hosts does not collide.
    assert_eq!(loader.descriptor_for("hosted").unwrap().listen_path, "/svc");
    assert_eq!(loader.descriptor_for("anyhost").unwrap().listen_path, "/svc");

    match loader.resolve(key(), Some("api.example.com"), "/svc/x") {
        Resolution::Matched(Endpoint::Chain(chain)) => {
            assert_eq!(chain.descriptor.api_id, "hosted");
        }
        _ => panic!("host-scoped API expected"),
    }
    match loader.resolve(key(), Some("other.example.com"), "/svc/x") {
        Resolution::Matched(Endpoint::Chain(chain)) => {
            assert_eq!(chain.descriptor.api_id, "anyhost");
        }
        _ => panic!("empty-domain API must catch any host"),
    }
}

#[test]
fn custom_port_router_initialised_lazily() {
    let loader = loader();
    let mut ported = spec("ported", "/p/");
    ported.listen_port = Some(8191);
    ported.use_keyless = true;
    loader.load(vec![ported]);

    assert!(matches!(
        loader.resolve(ListenKey::http(8191), None, "/p/x"),
        Resolution::Matched(Endpoint::Chain(_))
    ));
    assert!(matches!(
        loader.resolve(key(), None, "/p/x"),
        Resolution::NoRoute
    ));
}

#[test]
fn version_children_relinked_to_base() {
    let loader = loader();
    let mut base = spec("base", "/base/");
    base.version_data.not_versioned = false;
    base.version_data.default_version = "v1".into();
    base.version_data.versions.insert(
        "v1".into(),
        serde_json::from_value(serde_json::json!({"api_id": "child"})).unwrap(),
    );
    let child = spec("child", "/child/");
    loader.load(vec![base, child]);

    assert_eq!(
        loader
            .descriptor_for("child")
            .unwrap()
            .version_data
            .base_api_id
            .as_deref(),
        Some("base")
    );
    // Reload clears and recomputes the link rather than doubling it.
    let report = loader.load(vec![
        loader.descriptor_for("base").map(|a| (*a).clone()).unwrap(),
        spec("child", "/child/"),
    ]);
    assert_eq!(report.unloaded, 0);
}

#[test]
fn oas_descriptor_without_extension_is_abandoned() {
    let loader = loader();
    let mut oas = spec("oas", "/oas/");
    oas.is_oas = true;
    let report = loader.load(vec![oas, spec("ok", "/ok/")]);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.loaded, 1);
    assert!(loader.chain_for("oas").is_none());
    assert!(loader.chain_for("ok").is_some());
}

#[test]
fn tcp_descriptor_hands_off_to_forwarder() {
    struct Recorder(AtomicUsize);
    impl gantry_gateway::loader::TcpForwarder for Recorder {
        fn register(&self, _spec: &ApiDescriptor) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
    let loader = loader().with_tcp_forwarder(recorder.clone());
    let mut tcp = spec("tcp1", "");
    tcp.protocol = serde_json::from_value(serde_json::json!("tcp")).unwrap();
    tcp.target_url = String::new();
    loader.load(vec![tcp]);

    assert_eq!(recorder.0.load(Ordering::Relaxed), 1);
    assert!(matches!(
        loader.resolve(key(), None, "/tcp1/x"),
        Resolution::NoRoute
    ));
}

#[test]
fn unload_hook_fires_on_removal() {
    struct Recorder(AtomicUsize);
    impl UnloadHook for Recorder {
        fn api_unloaded(&self, _spec: &ApiDescriptor) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
    let loader = loader().with_unload_hook(recorder.clone());
    loader.load(vec![spec("a", "/a/"), spec("b", "/b/")]);
    assert_eq!(recorder.0.load(Ordering::Relaxed), 0);

    let report = loader.load(vec![spec("a", "/a/")]);
    assert_eq!(report.unloaded, 1);
    assert_eq!(recorder.0.load(Ordering::Relaxed), 1);
    assert!(loader.chain_for("b").is_none());
}
