use gantry_core::config::GatewayConfig;
use gantry_core::descriptor::ApiDescriptor;
use std::collections::HashMap;
use tracing::error;

/// Count how many descriptors claim each `hostname||listen_path` key. Built
/// once per reload; the arbiter decrements a key as claimants move off it.
pub fn build_collision_map(
    specs: &[ApiDescriptor],
    config: &GatewayConfig,
) -> HashMap<String, usize> {
    let mut map: HashMap<String, usize> = HashMap::new();
    for spec in specs {
        if !spec.is_http_family() {
            continue;
        }
        *map.entry(spec.collision_key(config)).or_insert(0) += 1;
    }
    map
}

/// Deterministic disambiguation of duplicate host+path pairs: at most one
/// descriptor keeps the original path.
///
/// A descriptor that already held exactly this path on the previous load
/// keeps it (stability across reloads). Every other claimant gets
/// `-<api_id>` appended while the key is contested, then `_` repeatedly
/// until the recomputed collision key is free. The suffix grows
/// monotonically, so the walk terminates.
pub fn arbitrate_listen_path(
    spec: &mut ApiDescriptor,
    collisions: &mut HashMap<String, usize>,
    prev: Option<&ApiDescriptor>,
    config: &GatewayConfig,
) {
    let original_key = spec.collision_key(config);
    let claimants = collisions.get(&original_key).copied().unwrap_or(0);
    if claimants <= 1 {
        return;
    }

    if let Some(prev) = prev {
        if prev.listen_path == spec.listen_path {
            return;
        }
    }

    let original = spec.listen_path.clone();
    spec.listen_path = format!("{}-{}", spec.listen_path, spec.api_id);

    let mut budget = collisions.len() + 1;
    while collisions.contains_key(&spec.collision_key(config)) {
        spec.listen_path.push('_');
        budget -= 1;
        assert!(budget > 0, "listen-path suffixing must terminate");
    }

    // This descriptor no longer claims the contested key; the remaining
    // claimant may keep it.
    if let Some(count) = collisions.get_mut(&original_key) {
        *count -= 1;
    }
    collisions.insert(spec.collision_key(config), 1);

    error!(
        api_id = %spec.api_id,
        old = %original,
        new = %spec.listen_path,
        "Listen path collision, path changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(api_id: &str, path: &str) -> ApiDescriptor {
        serde_json::from_value(serde_json::json!({
            "api_id": api_id,
            "listen_path": path,
            "target_url": "http://upstream.local",
        }))
        .unwrap()
    }

    #[test]
    fn test_no_collision_keeps_path() {
        let config = GatewayConfig::default();
        let specs = vec![spec("a", "/x"), spec("b", "/y")];
        let mut map = build_collision_map(&specs, &config);
        let mut a = specs[0].clone();
        arbitrate_listen_path(&mut a, &mut map, None, &config);
        assert_eq!(a.listen_path, "/x");
    }

    #[test]
    fn test_first_load_exactly_one_keeps_path() {
        let config = GatewayConfig::default();
        let specs = vec![spec("a", "/x"), spec("b", "/x")];
        let mut map = build_collision_map(&specs, &config);

        let mut a = specs[0].clone();
        arbitrate_listen_path(&mut a, &mut map, None, &config);
        assert_eq!(a.listen_path, "/x-a");

        let mut b = specs[1].clone();
        arbitrate_listen_path(&mut b, &mut map, None, &config);
        assert_eq!(b.listen_path, "/x");
    }

    #[test]
    fn test_stability_prefers_previous_holder() {
        let config = GatewayConfig::default();
        let specs = vec![spec("a", "/x"), spec("b", "/x")];
        let mut map = build_collision_map(&specs, &config);

        // `a` held `/x` on the previous load, so it keeps it and `b` moves.
        let prev_a = spec("a", "/x");
        let mut a = specs[0].clone();
        arbitrate_listen_path(&mut a, &mut map, Some(&prev_a), &config);
        assert_eq!(a.listen_path, "/x");

        let mut b = specs[1].clone();
        arbitrate_listen_path(&mut b, &mut map, None, &config);
        assert_eq!(b.listen_path, "/x-b");
    }

    #[test]
    fn test_previous_suffixed_path_is_recreated() {
        let config = GatewayConfig::default();
        let specs = vec![spec("a", "/x"), spec("b", "/x")];
        let mut map = build_collision_map(&specs, &config);

        // `b` was suffixed on the previous load; its incoming path `/x`
        // does not match, so it is suffixed again to the same form.
        let prev_b = spec("b", "/x-b");
        let mut b = specs[1].clone();
        arbitrate_listen_path(&mut b, &mut map, Some(&prev_b), &config);
        assert_eq!(b.listen_path, "/x-b");
    }

    #[test]
    fn test_suffix_cascade_appends_underscores() {
        let config = GatewayConfig::default();
        // `c` already owns the `-<api_id>` form `a` moves to.
        let specs = vec![spec("a", "/x"), spec("b", "/x"), spec("c", "/x-a")];
        let mut map = build_collision_map(&specs, &config);

        let mut a = specs[0].clone();
        arbitrate_listen_path(&mut a, &mut map, None, &config);
        assert_eq!(a.listen_path, "/x-a_");

        let mut b = specs[1].clone();
        arbitrate_listen_path(&mut b, &mut map, None, &config);

        let mut paths = vec![a.listen_path, b.listen_path, "/x-a".to_string()];
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 3, "paths must be pairwise distinct");
    }

    #[test]
    fn test_domains_partition_collisions() {
        let config = GatewayConfig {
            enable_custom_domains: true,
            ..Default::default()
        };
        let mut a = spec("a", "/x");
        a.domain = "one.example.com".into();
        let mut b = spec("b", "/x");
        b.domain = "two.example.com".into();
        let specs = vec![a, b];
        let mut map = build_collision_map(&specs, &config);

        let mut a = specs[0].clone();
        arbitrate_listen_path(&mut a, &mut map, None, &config);
        assert_eq!(a.listen_path, "/x", "different hosts do not collide");
    }
}
