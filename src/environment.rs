//! Per-command environment assembly with origin tracking.
//!
//! The final environment is built in four ordered merge steps: system
//! variables filtered by the effective allowlist, then global vars, then
//! group vars, then the command's own `env_vars`. Every write records the
//! writing layer in a parallel origin map. Origins exist for
//! observability (dry-run output, debug logs) and are never reconstructed
//! after the fact: identical values at different layers would make that
//! ambiguous, so both maps are written in the same statement.

use indexmap::IndexMap;
use serde::Serialize;

/// The configuration layer that last wrote an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EnvOrigin {
    /// Imported from the launching process, permitted by the allowlist.
    System,
    /// Global vars layer.
    Global,
    /// Group vars layer, tagged with the group name.
    Group(String),
    /// Command `env_vars` layer, tagged with the command name.
    Command(String),
}

impl std::fmt::Display for EnvOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvOrigin::System => write!(f, "System (filtered by allowlist)"),
            EnvOrigin::Global => write!(f, "Global"),
            EnvOrigin::Group(name) => write!(f, "Group[{name}]"),
            EnvOrigin::Command(name) => write!(f, "Command[{name}]"),
        }
    }
}

impl EnvOrigin {
    /// The coarse `source` tag used in structured dry-run output.
    #[must_use]
    pub fn source_tag(&self) -> &'static str {
        match self {
            EnvOrigin::System => "system",
            EnvOrigin::Global | EnvOrigin::Group(_) => "vars",
            EnvOrigin::Command(_) => "command",
        }
    }
}

/// How a group arrived at its effective allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowlistMode {
    /// Field absent: the global baseline applies.
    Inherit,
    /// Field present and non-empty: replaces the global baseline.
    Override,
    /// Field present and empty: no system variable may be imported.
    Reject,
}

impl std::fmt::Display for AllowlistMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllowlistMode::Inherit => write!(f, "inherit"),
            AllowlistMode::Override => write!(f, "override"),
            AllowlistMode::Reject => write!(f, "reject"),
        }
    }
}

/// Environment and origin maps, always written together.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEnv {
    pub env: IndexMap<String, String>,
    pub origins: IndexMap<String, EnvOrigin>,
}

impl ResolvedEnv {
    fn set(&mut self, key: &str, value: &str, origin: EnvOrigin) {
        self.env.insert(key.to_string(), value.to_string());
        self.origins.insert(key.to_string(), origin);
    }
}

/// Compute a group's effective allowlist from the global baseline and the
/// group's optional override.
#[must_use]
pub fn effective_allowlist(
    global: &[String],
    group: Option<&[String]>,
) -> (Vec<String>, AllowlistMode) {
    match group {
        None => (global.to_vec(), AllowlistMode::Inherit),
        Some([]) => (Vec::new(), AllowlistMode::Reject),
        Some(list) => (list.to_vec(), AllowlistMode::Override),
    }
}

/// Assemble the final `(env, origins)` pair for one command.
///
/// `system` is a snapshot of the launching process's environment, taken
/// once per run. `global_vars` and `group_vars` are the already-expanded
/// vars maps (including anything `env_import` pulled in). `command_env`
/// holds the command's parsed KEY=VALUE pairs.
#[must_use]
pub fn resolve(
    system: &IndexMap<String, String>,
    allowlist: &[String],
    global_vars: &IndexMap<String, String>,
    group_name: &str,
    group_vars: &IndexMap<String, String>,
    command_name: &str,
    command_env: &[(String, String)],
) -> ResolvedEnv {
    let mut resolved = ResolvedEnv::default();

    // Step 1: system, gated by the effective allowlist, in allowlist order.
    for name in allowlist {
        if let Some(value) = system.get(name) {
            resolved.set(name, value, EnvOrigin::System);
        }
    }

    // Step 2: global vars overlay.
    for (key, value) in global_vars {
        resolved.set(key, value, EnvOrigin::Global);
    }

    // Step 3: group vars overlay.
    for (key, value) in group_vars {
        resolved.set(key, value, EnvOrigin::Group(group_name.to_string()));
    }

    // Step 4: command env_vars overlay.
    for (key, value) in command_env {
        resolved.set(key, value, EnvOrigin::Command(command_name.to_string()));
    }

    resolved
}

/// Snapshot the launching process's environment in iteration order.
#[must_use]
pub fn system_snapshot() -> IndexMap<String, String> {
    std::env::vars().collect()
}

/// Filter an `env_import` list down to names the allowlist permits and the
/// system environment actually has, yielding name/value pairs for the
/// owning vars layer.
#[must_use]
pub fn import_from_system(
    system: &IndexMap<String, String>,
    allowlist: &[String],
    names: &[String],
) -> IndexMap<String, String> {
    let mut imported = IndexMap::new();
    for name in names {
        if !allowlist.iter().any(|a| a == name) {
            continue;
        }
        if let Some(value) = system.get(name) {
            imported.insert(name.clone(), value.clone());
        }
    }
    imported
}
