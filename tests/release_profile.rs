//! Build settings the runtime depends on

/// Dispatcher tasks, state observers and worker threads are isolated with
/// `catch_unwind`, which only works when panics unwind.
#[test]
fn release_profile_unwinds_on_panic() {
    let manifest: toml::Value = toml::from_str(include_str!("../Cargo.toml")).unwrap();
    let strategy = manifest
        .get("profile")
        .and_then(|profiles| profiles.get("release"))
        .and_then(|release| release.get("panic"))
        .and_then(toml::Value::as_str)
        .unwrap_or("unwind");
    assert_eq!(strategy, "unwind");
}
