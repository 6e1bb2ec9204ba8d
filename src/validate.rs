//! Structural and security validation.
//!
//! Structural rules run once over the decoded tree before anything is
//! expanded. Per-command security rules (environment hygiene, path
//! policy) run over the materialized plan at gate time, after template
//! and variable expansion, so they see exactly what would be executed.

use crate::config::Config;
use crate::config::plan::RuntimeCommand;
use crate::errors::{ConfigurationError, RunnerError, ValidationError};
use regex::Regex;
use std::collections::HashSet;
use std::path::Component;
use std::sync::LazyLock;

/// Valid template and environment-variable names.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid name regex"));

/// Environment variables that change loader behavior in the child. Known
/// injection vectors; only permitted when listed under `allow_unsafe_env`.
const DANGEROUS_ENV_PREFIXES: &[&str] = &["DYLD_"];
const DANGEROUS_ENV_NAMES: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT"];

/// Shell metacharacters rejected in environment values. The runner never
/// invokes a shell itself, but values flow into child processes that may.
const VALUE_METACHARACTERS: &[char] = &['`', '$', ';', '|', '&', '<', '>'];

/// Structural rules over the decoded tree: uniqueness, reserved names,
/// field exclusivity.
pub fn validate_structure(config: &Config) -> Result<(), RunnerError> {
    for name in config.templates.keys() {
        if name.starts_with("__") {
            return Err(ConfigurationError::ReservedTemplateName { name: name.clone() }.into());
        }
        if !NAME_PATTERN.is_match(name) {
            return Err(ConfigurationError::BadTemplateName { name: name.clone() }.into());
        }
    }

    let mut group_names = HashSet::new();
    for group in &config.groups {
        if group.name.is_empty() {
            return Err(ConfigurationError::MissingField {
                resource: "group".to_string(),
                field: "name".to_string(),
            }
            .into());
        }
        if !group_names.insert(group.name.as_str()) {
            return Err(ConfigurationError::DuplicateGroup {
                name: group.name.clone(),
            }
            .into());
        }

        let mut command_names = HashSet::new();
        for cmd in &group.commands {
            let resource = format!("{}.{}", group.name, cmd.name);
            if cmd.name.is_empty() {
                return Err(ConfigurationError::MissingField {
                    resource: group.name.clone(),
                    field: "command name".to_string(),
                }
                .into());
            }
            if !command_names.insert(cmd.name.as_str()) {
                return Err(ConfigurationError::DuplicateCommand {
                    group: group.name.clone(),
                    name: cmd.name.clone(),
                }
                .into());
            }

            match (&cmd.cmd, &cmd.template) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(ConfigurationError::CmdTemplateExclusivity { resource }.into());
                }
                _ => {}
            }
            if cmd.template.is_some() {
                if !cmd.args.is_empty() {
                    return Err(ConfigurationError::FieldForbiddenWithTemplate {
                        resource,
                        field: "args".to_string(),
                    }
                    .into());
                }
                if !cmd.env_vars.is_empty() {
                    return Err(ConfigurationError::FieldForbiddenWithTemplate {
                        resource,
                        field: "env_vars".to_string(),
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// Per-command rules over the materialized form: environment hygiene and
/// path policy. Runs at gate time, before verification and risk.
pub fn validate_command(
    rc: &RuntimeCommand,
    allow_unsafe_env: &[String],
) -> Result<(), RunnerError> {
    let resource = rc.resource();

    for (key, value) in &rc.env_pairs {
        if !NAME_PATTERN.is_match(key) {
            return Err(ValidationError::BadEnvKey {
                resource: resource.clone(),
                key: key.clone(),
            }
            .into());
        }
        if let Some(reason) = value_violation(value) {
            return Err(ValidationError::BadEnvValue {
                resource: resource.clone(),
                key: key.clone(),
                reason,
            }
            .into());
        }
    }

    // Injection vectors are checked over the final environment: any layer
    // can smuggle them in, including an overly broad allowlist.
    for key in rc.env.env.keys() {
        if is_dangerous_env(key) && !allow_unsafe_env.iter().any(|a| a == key) {
            return Err(ValidationError::DangerousEnvVar {
                resource: resource.clone(),
                key: key.clone(),
            }
            .into());
        }
    }

    // Path policy.
    let cmd_path = std::path::Path::new(&rc.cmd);
    if rc.cmd.contains('/') && !cmd_path.is_absolute() {
        return Err(ValidationError::NotAbsolute {
            resource: resource.clone(),
            field: "cmd".to_string(),
            path: rc.cmd.clone(),
        }
        .into());
    }
    match &rc.resolved_cmd {
        None => {
            return Err(ValidationError::CommandNotFound {
                resource: resource.clone(),
                cmd: rc.cmd.clone(),
            }
            .into());
        }
        Some(resolved) => {
            if !is_executable(resolved) {
                return Err(ValidationError::NotExecutable {
                    resource: resource.clone(),
                    path: resolved.to_string_lossy().into_owned(),
                }
                .into());
            }
        }
    }

    if let Some(workdir) = &rc.workdir {
        if !workdir.is_absolute() {
            return Err(ValidationError::NotAbsolute {
                resource: resource.clone(),
                field: "workdir".to_string(),
                path: workdir.to_string_lossy().into_owned(),
            }
            .into());
        }
    }

    if let Some(output) = &rc.output {
        if !output.is_absolute() {
            return Err(ValidationError::NotAbsolute {
                resource: resource.clone(),
                field: "output".to_string(),
                path: output.to_string_lossy().into_owned(),
            }
            .into());
        }
        if output
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ValidationError::PathTraversal {
                resource,
                field: "output".to_string(),
                path: output.to_string_lossy().into_owned(),
            }
            .into());
        }
    }

    Ok(())
}

fn is_dangerous_env(key: &str) -> bool {
    DANGEROUS_ENV_NAMES.contains(&key)
        || DANGEROUS_ENV_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// First hygiene violation in an environment value, if any.
fn value_violation(value: &str) -> Option<String> {
    if value.chars().any(|c| c.is_control()) {
        return Some("control characters".to_string());
    }
    if let Some(c) = value.chars().find(|c| VALUE_METACHARACTERS.contains(c)) {
        return Some(format!("the shell metacharacter '{c}'"));
    }
    None
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
