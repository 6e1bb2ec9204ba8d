//! Tests for environment assembly: layering, allowlists, origin tracking.

use indexmap::IndexMap;
use saferun::environment::{
    self, AllowlistMode, EnvOrigin, effective_allowlist, import_from_system,
};

fn map(entries: &[(&str, &str)]) -> IndexMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Allowlist inheritance
// ---------------------------------------------------------------------------

#[test]
fn test_allowlist_absent_inherits_global() {
    let (list, mode) = effective_allowlist(&names(&["PATH", "HOME"]), None);
    assert_eq!(list, names(&["PATH", "HOME"]));
    assert_eq!(mode, AllowlistMode::Inherit);
}

#[test]
fn test_allowlist_nonempty_overrides_global() {
    let group = names(&["LANG"]);
    let (list, mode) = effective_allowlist(&names(&["PATH", "HOME"]), Some(&group));
    assert_eq!(list, names(&["LANG"]));
    assert_eq!(mode, AllowlistMode::Override);
}

#[test]
fn test_allowlist_empty_rejects_all() {
    let group: Vec<String> = Vec::new();
    let (list, mode) = effective_allowlist(&names(&["PATH", "HOME"]), Some(&group));
    assert!(list.is_empty());
    assert_eq!(mode, AllowlistMode::Reject);
}

// ---------------------------------------------------------------------------
// Layered resolution with origins
// ---------------------------------------------------------------------------

#[test]
fn test_system_layer_is_allowlist_filtered() {
    let system = map(&[("PATH", "/usr/bin"), ("HOME", "/root"), ("SECRET", "x")]);
    let empty = map(&[]);
    let resolved = environment::resolve(
        &system,
        &names(&["PATH", "HOME"]),
        &empty,
        "build",
        &empty,
        "compile",
        &[],
    );

    assert_eq!(resolved.env.get("PATH").unwrap(), "/usr/bin");
    assert_eq!(resolved.env.get("HOME").unwrap(), "/root");
    assert!(!resolved.env.contains_key("SECRET"));
    assert_eq!(resolved.origins.get("PATH").unwrap(), &EnvOrigin::System);
}

#[test]
fn test_layer_order_system_global_group_command() {
    let system = map(&[("APP_ENV", "from_system")]);
    let global = map(&[("APP_ENV", "production"), ("G_ONLY", "g")]);
    let group = map(&[("APP_ENV", "staging")]);
    let resolved = environment::resolve(
        &system,
        &names(&["APP_ENV"]),
        &global,
        "deploy",
        &group,
        "push",
        &[("APP_ENV".to_string(), "test".to_string())],
    );

    assert_eq!(resolved.env.get("APP_ENV").unwrap(), "test");
    assert_eq!(
        resolved.origins.get("APP_ENV").unwrap(),
        &EnvOrigin::Command("push".to_string())
    );
    assert_eq!(resolved.origins.get("G_ONLY").unwrap(), &EnvOrigin::Global);
}

#[test]
fn test_origin_reflects_last_writer_with_identical_values() {
    // Same value at every layer: origin must still name the last writer,
    // which is impossible to get right by comparing values after the fact.
    let system = map(&[("DUP", "same")]);
    let global = map(&[("DUP", "same")]);
    let group = map(&[("DUP", "same")]);
    let resolved = environment::resolve(
        &system,
        &names(&["DUP"]),
        &global,
        "g1",
        &group,
        "c1",
        &[("DUP".to_string(), "same".to_string())],
    );

    assert_eq!(resolved.env.get("DUP").unwrap(), "same");
    assert_eq!(
        resolved.origins.get("DUP").unwrap(),
        &EnvOrigin::Command("c1".to_string())
    );
}

#[test]
fn test_group_origin_carries_group_name() {
    let empty = map(&[]);
    let group = map(&[("APP_DIR", "/opt/app")]);
    let resolved = environment::resolve(&empty, &[], &empty, "build", &group, "echo", &[]);

    assert_eq!(
        resolved.origins.get("APP_DIR").unwrap(),
        &EnvOrigin::Group("build".to_string())
    );
}

#[test]
fn test_every_env_key_has_an_origin() {
    let system = map(&[("PATH", "/bin")]);
    let global = map(&[("A", "1")]);
    let group = map(&[("B", "2")]);
    let resolved = environment::resolve(
        &system,
        &names(&["PATH"]),
        &global,
        "g",
        &group,
        "c",
        &[("C".to_string(), "3".to_string())],
    );

    for key in resolved.env.keys() {
        assert!(resolved.origins.contains_key(key), "no origin for {key}");
    }
    assert_eq!(resolved.env.len(), resolved.origins.len());
}

// ---------------------------------------------------------------------------
// env_import filtering
// ---------------------------------------------------------------------------

#[test]
fn test_import_respects_allowlist() {
    let system = map(&[("HOME", "/root"), ("EDITOR", "vi")]);
    let imported = import_from_system(
        &system,
        &names(&["HOME"]),
        &names(&["HOME", "EDITOR"]),
    );

    assert_eq!(imported.get("HOME").unwrap(), "/root");
    assert!(!imported.contains_key("EDITOR"));
}

#[test]
fn test_import_skips_unset_variables() {
    let system = map(&[]);
    let imported = import_from_system(&system, &names(&["HOME"]), &names(&["HOME"]));
    assert!(imported.is_empty());
}

#[test]
fn test_origin_source_tags() {
    assert_eq!(EnvOrigin::System.source_tag(), "system");
    assert_eq!(EnvOrigin::Global.source_tag(), "vars");
    assert_eq!(EnvOrigin::Group("g".into()).source_tag(), "vars");
    assert_eq!(EnvOrigin::Command("c".into()).source_tag(), "command");
}
