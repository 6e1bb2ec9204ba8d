//! Runtime plan materialization.
//!
//! Turns a decoded configuration tree into the immutable plan the executor
//! walks: templates instantiated, variables expanded, allowlists and vars
//! flattened per group, environments assembled with origins, and command
//! paths resolved against PATH. Inheritance is materialized once, here;
//! nothing chases parent pointers at execution time.

use crate::config::{Config, GroupConfig, template, vars};
use crate::environment::{self, AllowlistMode, ResolvedEnv};
use crate::errors::{ConfigurationError, RunnerError, ValidationError};
use crate::risk::RiskLevel;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Default wall-clock ceiling per command, seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Default output-capture cap, bytes.
pub const DEFAULT_OUTPUT_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// The materialized plan for one run.
#[derive(Debug, Clone)]
pub struct RuntimePlan {
    pub global: RuntimeGlobal,
    pub groups: Vec<RuntimeGroup>,
    pub continue_on_group_failure: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeGlobal {
    pub allowlist: Vec<String>,
    /// Expanded vars, including anything `env_import` pulled in.
    pub vars: IndexMap<String, String>,
    pub env_import: Vec<String>,
    pub verify_files: Vec<PathBuf>,
    pub timeout: u64,
    pub allow_unsafe_env: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeGroup {
    pub name: String,
    pub description: Option<String>,
    pub workdir: Option<PathBuf>,
    pub priority: Option<i64>,
    pub allowlist: Vec<String>,
    pub allowlist_mode: AllowlistMode,
    /// The group's own `env_allowlist` field as written, for analysis.
    pub declared_allowlist: Option<Vec<String>>,
    pub env_import: Vec<String>,
    /// Expanded group vars layered over imports.
    pub vars: IndexMap<String, String>,
    pub verify_files: Vec<PathBuf>,
    pub keep_temp_dirs: bool,
    pub fail_fast: bool,
    pub commands: Vec<RuntimeCommand>,
}

#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    pub name: String,
    pub group: String,
    pub description: Option<String>,
    /// Fully expanded command string as configured.
    pub cmd: String,
    /// Absolute path after PATH resolution; `None` when the binary could
    /// not be found (surfaces as a validation failure at gate time).
    pub resolved_cmd: Option<PathBuf>,
    pub args: Vec<String>,
    /// Parsed and expanded KEY=VALUE pairs from `env_vars`.
    pub env_pairs: Vec<(String, String)>,
    /// Final environment and origin maps for the spawn.
    pub env: ResolvedEnv,
    pub timeout: u64,
    pub workdir: Option<PathBuf>,
    pub run_as_user: Option<String>,
    pub run_as_group: Option<String>,
    pub max_risk_level: RiskLevel,
    pub output: Option<PathBuf>,
    pub output_size_limit: u64,
    pub privileged: bool,
}

impl RuntimeCommand {
    /// `group.command` path used in every user-facing message.
    #[must_use]
    pub fn resource(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

/// Materialize the runtime plan from a decoded config and a snapshot of
/// the launching process's environment.
pub fn materialize(
    config: &Config,
    system: &IndexMap<String, String>,
) -> Result<RuntimePlan, RunnerError> {
    crate::validate::validate_structure(config)?;

    let empty = IndexMap::new();
    let global_timeout = config.global.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);

    // Global vars: env_import first (literal values), then the declared
    // vars expanded over them. Declared names shadow imported ones.
    let global_imported = environment::import_from_system(
        system,
        &config.global.env_allowlist,
        &config.global.env_import,
    );
    let global_declared =
        vars::expand_map(&config.global.vars, &global_imported, &empty, "global")?;
    let mut global_vars = global_imported;
    global_vars.extend(global_declared);

    let global = RuntimeGlobal {
        allowlist: config.global.env_allowlist.clone(),
        vars: global_vars,
        env_import: config.global.env_import.clone(),
        verify_files: config.global.verify_files.iter().map(PathBuf::from).collect(),
        timeout: global_timeout,
        allow_unsafe_env: config.global.allow_unsafe_env.clone(),
    };

    let mut groups = Vec::with_capacity(config.groups.len());
    for group_cfg in &config.groups {
        groups.push(materialize_group(config, group_cfg, &global, system)?);
    }

    Ok(RuntimePlan {
        global,
        groups,
        continue_on_group_failure: config.continue_on_group_failure,
    })
}

fn materialize_group(
    config: &Config,
    group_cfg: &GroupConfig,
    global: &RuntimeGlobal,
    system: &IndexMap<String, String>,
) -> Result<RuntimeGroup, RunnerError> {
    let empty = IndexMap::new();
    let (allowlist, allowlist_mode) = environment::effective_allowlist(
        &global.allowlist,
        group_cfg.env_allowlist.as_deref(),
    );

    let group_imported =
        environment::import_from_system(system, &allowlist, &group_cfg.env_import);
    let group_declared = vars::expand_map(
        &group_cfg.vars,
        &group_imported,
        &global.vars,
        &group_cfg.name,
    )?;
    let mut group_vars = group_imported;
    group_vars.extend(group_declared);

    let workdir = group_cfg.workdir.as_ref().map(|w| {
        vars::expand(
            w,
            &vars::VarScope {
                command: &empty,
                group: &group_vars,
                global: &global.vars,
            },
            &format!("{}.workdir", group_cfg.name),
        )
        .map(PathBuf::from)
    });
    let workdir = workdir.transpose()?;

    let mut commands = Vec::with_capacity(group_cfg.commands.len());
    for cmd_cfg in &group_cfg.commands {
        commands.push(materialize_command(
            config, group_cfg, cmd_cfg, global, &group_vars, &allowlist, system,
        )?);
    }

    Ok(RuntimeGroup {
        name: group_cfg.name.clone(),
        description: group_cfg.description.clone(),
        workdir,
        priority: group_cfg.priority,
        allowlist,
        allowlist_mode,
        declared_allowlist: group_cfg.env_allowlist.clone(),
        env_import: group_cfg.env_import.clone(),
        vars: group_vars,
        verify_files: group_cfg.verify_files.iter().map(PathBuf::from).collect(),
        keep_temp_dirs: group_cfg.keep_temp_dirs,
        fail_fast: group_cfg.fail_fast,
        commands,
    })
}

#[allow(clippy::too_many_arguments)]
fn materialize_command(
    config: &Config,
    group_cfg: &GroupConfig,
    cmd_cfg: &crate::config::CommandConfig,
    global: &RuntimeGlobal,
    group_vars: &IndexMap<String, String>,
    allowlist: &[String],
    system: &IndexMap<String, String>,
) -> Result<RuntimeCommand, RunnerError> {
    let resource = format!("{}.{}", group_cfg.name, cmd_cfg.name);

    // Template expansion first, then variable expansion over the result.
    let (raw_cmd, raw_args, raw_env_vars, tpl_workdir, tpl_timeout, tpl_size, tpl_risk) =
        match &cmd_cfg.template {
            Some(tpl_name) => {
                let tpl = config.templates.get(tpl_name).ok_or_else(|| {
                    ConfigurationError::UnknownTemplate {
                        resource: resource.clone(),
                        template: tpl_name.clone(),
                    }
                })?;
                let expanded = template::expand(tpl_name, tpl, &cmd_cfg.params)?;
                (
                    expanded.cmd,
                    expanded.args,
                    expanded.env_vars,
                    expanded.workdir,
                    expanded.timeout,
                    expanded.output_size_limit,
                    expanded.risk_level,
                )
            }
            None => (
                cmd_cfg.cmd.clone().unwrap_or_default(),
                cmd_cfg.args.clone(),
                cmd_cfg.env_vars.clone(),
                None,
                None,
                None,
                None,
            ),
        };

    let cmd_vars = vars::expand_map(&cmd_cfg.vars, group_vars, &global.vars, &resource)?;
    let scope = vars::VarScope {
        command: &cmd_vars,
        group: group_vars,
        global: &global.vars,
    };

    let cmd = vars::expand(&raw_cmd, &scope, &format!("{resource}.cmd"))?;
    let mut args = Vec::with_capacity(raw_args.len());
    for (i, arg) in raw_args.iter().enumerate() {
        args.push(vars::expand(arg, &scope, &format!("{resource}.args[{i}]"))?);
    }

    let mut env_pairs = Vec::with_capacity(raw_env_vars.len());
    for entry in &raw_env_vars {
        let expanded = vars::expand(entry, &scope, &format!("{resource}.env_vars"))?;
        let Some((key, value)) = expanded.split_once('=') else {
            return Err(ValidationError::BadEnvValue {
                resource: resource.clone(),
                key: expanded,
                reason: "missing '=' separator".to_string(),
            }
            .into());
        };
        env_pairs.push((key.to_string(), value.to_string()));
    }

    let workdir_src = cmd_cfg.workdir.clone().or(tpl_workdir);
    let workdir = match workdir_src {
        Some(w) => Some(PathBuf::from(vars::expand(
            &w,
            &scope,
            &format!("{resource}.workdir"),
        )?)),
        None => None,
    };

    let output = match &cmd_cfg.output {
        Some(o) => Some(PathBuf::from(vars::expand(
            o,
            &scope,
            &format!("{resource}.output"),
        )?)),
        None => None,
    };

    let env = environment::resolve(
        system,
        allowlist,
        &global.vars,
        &group_cfg.name,
        group_vars,
        &cmd_cfg.name,
        &env_pairs,
    );

    let resolved_cmd = resolve_cmd_path(&cmd, &env.env, system);

    Ok(RuntimeCommand {
        name: cmd_cfg.name.clone(),
        group: group_cfg.name.clone(),
        description: cmd_cfg.description.clone(),
        cmd,
        resolved_cmd,
        args,
        env_pairs,
        env,
        timeout: cmd_cfg
            .timeout
            .or(tpl_timeout)
            .unwrap_or(global.timeout),
        workdir,
        run_as_user: cmd_cfg.run_as_user.clone(),
        run_as_group: cmd_cfg.run_as_group.clone(),
        max_risk_level: cmd_cfg
            .max_risk_level
            .or(tpl_risk)
            .unwrap_or(RiskLevel::Low),
        output,
        output_size_limit: cmd_cfg
            .output_size_limit
            .or(tpl_size)
            .unwrap_or(DEFAULT_OUTPUT_SIZE_LIMIT),
        privileged: cmd_cfg.privileged,
    })
}

/// Resolve the command string to an absolute executable path.
///
/// Absolute paths are taken as-is (existence is checked by the validator).
/// Bare names are searched in PATH, preferring the command's own resolved
/// environment over the launching process's. Relative paths with
/// separators are never resolved; the validator rejects them.
fn resolve_cmd_path(
    cmd: &str,
    env: &IndexMap<String, String>,
    system: &IndexMap<String, String>,
) -> Option<PathBuf> {
    if cmd.is_empty() {
        return None;
    }
    let path = Path::new(cmd);
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }
    if cmd.contains('/') {
        return None;
    }

    let search = env
        .get("PATH")
        .or_else(|| system.get("PATH"))
        .cloned()
        .unwrap_or_default();
    for dir in search.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(cmd);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
