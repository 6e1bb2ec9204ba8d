//! Error taxonomy for the runner.
//!
//! Every layer returns values of these types; nothing panics except the
//! privilege-restore abort path in `privilege`, which exits the process.
//! User-facing messages name the offending resource and, where a policy
//! blocked something, carry a remediation string the operator can act on.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for a run. Each variant is one kind from the taxonomy;
/// the kind string is what audit records and exit-code mapping key off.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    System(#[from] SystemError),
}

impl RunnerError {
    /// Stable kind label used in audit records and structured output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::Configuration(_) => "configuration",
            RunnerError::Variable(_) => "variable",
            RunnerError::Verification(_) => "verification",
            RunnerError::Validation(_) => "validation",
            RunnerError::Security(_) => "security",
            RunnerError::Privilege(_) => "privilege",
            RunnerError::Execution(_) => "execution",
            RunnerError::Timeout(_) => "timeout",
            RunnerError::System(_) => "system",
        }
    }

    /// Remediation hint for policy blocks, if the error carries one.
    #[must_use]
    pub fn remediation(&self) -> Option<&str> {
        match self {
            RunnerError::Security(e) => Some(e.remediation()),
            _ => None,
        }
    }
}

/// Syntax, schema, reserved names, field exclusivity, bad version.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration is not valid TOML: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("configuration is not valid UTF-8")]
    Encoding,

    #[error("missing or empty `version` field")]
    MissingVersion,

    #[error("duplicate group name '{name}'")]
    DuplicateGroup { name: String },

    #[error("duplicate command name '{name}' in group '{group}'")]
    DuplicateCommand { group: String, name: String },

    #[error("command '{resource}' must set exactly one of `cmd` or `template`")]
    CmdTemplateExclusivity { resource: String },

    #[error("command '{resource}' sets `{field}`, which is not allowed together with `template`")]
    FieldForbiddenWithTemplate { resource: String, field: String },

    #[error("template name '{name}' is invalid (must match [A-Za-z_][A-Za-z0-9_]*)")]
    BadTemplateName { name: String },

    #[error("template name '{name}' uses the reserved '__' prefix")]
    ReservedTemplateName { name: String },

    #[error("command '{resource}' references unknown template '{template}'")]
    UnknownTemplate { resource: String, template: String },

    #[error("template '{template}' uses %{{...}} in its definition, which is only allowed in parameter values")]
    VariableInTemplate { template: String },

    #[error("group or command '{resource}' is missing required field `{field}`")]
    MissingField { resource: String, field: String },
}

/// Undefined `%{...}`, expansion cycle, unresolved template parameter.
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("undefined variable %{{{name}}} in {field}")]
    Undefined { name: String, field: String },

    #[error("variable expansion in {field} did not settle after {limit} passes (cycle?)")]
    Cycle { field: String, limit: usize },

    #[error("template '{template}' requires parameter '{param}', which was not supplied")]
    MissingParam { template: String, param: String },

    #[error("template '{template}' parameter '{param}' must be {expected}")]
    BadParamType {
        template: String,
        param: String,
        expected: &'static str,
    },

    #[error("template '{template}': ${{@{param}}} must occupy an entire array element")]
    SpliceNotWholeElement { template: String, param: String },

    #[error("template '{template}': ${{?{param}}} is only allowed at array-element granularity")]
    OptionalOutsideArray { template: String, param: String },
}

/// Why a digest check did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    Missing,
    Mismatch,
    ReadError,
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyFailure::Missing => write!(f, "missing"),
            VerifyFailure::Mismatch => write!(f, "mismatch"),
            VerifyFailure::ReadError => write!(f, "read_error"),
        }
    }
}

/// Digest missing, digest mismatch, safe-open failure, store setup problems.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification failed for {path}: {cause}")]
    Failed { path: PathBuf, cause: VerifyFailure },

    #[error("refusing to open {path}: {reason}")]
    UnsafePath { path: PathBuf, reason: String },

    #[error("digest store root {root} is missing or not a directory")]
    StoreUnavailable { root: PathBuf },

    #[error("digest entry for {path} already exists (use force to overwrite)")]
    EntryExists { path: PathBuf },

    #[error("digest entry for {path} is corrupt: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    #[error("i/o error in digest store for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Forbidden pattern match, bad environment key/value, path policy violations.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("command '{resource}': environment key '{key}' is not a valid variable name")]
    BadEnvKey { resource: String, key: String },

    #[error("command '{resource}': environment value for '{key}' contains {reason}")]
    BadEnvValue {
        resource: String,
        key: String,
        reason: String,
    },

    #[error(
        "command '{resource}': environment variable '{key}' is a known injection vector; \
         list it under global `allow_unsafe_env` to permit it"
    )]
    DangerousEnvVar { resource: String, key: String },

    #[error("command '{resource}': `{field}` must be an absolute path (got '{path}')")]
    NotAbsolute {
        resource: String,
        field: String,
        path: String,
    },

    #[error("command '{resource}': `{field}` contains '..' after normalization: '{path}'")]
    PathTraversal {
        resource: String,
        field: String,
        path: String,
    },

    #[error("command '{resource}': '{cmd}' not found in PATH")]
    CommandNotFound { resource: String, cmd: String },

    #[error("command '{resource}': '{path}' does not exist or is not an executable file")]
    NotExecutable { resource: String, path: String },
}

/// Risk-level policy violations.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error(
        "command '{resource}' is classified {actual} ({description}), which exceeds \
         max_risk_level = \"{allowed}\""
    )]
    RiskExceeded {
        resource: String,
        actual: String,
        allowed: String,
        description: String,
        remediation: String,
    },

    #[error(
        "command '{resource}' invokes the privilege-escalation binary '{pattern}'; \
         escalation commands are never run directly"
    )]
    EscalationCommand {
        resource: String,
        pattern: String,
        remediation: String,
    },
}

impl SecurityError {
    #[must_use]
    pub fn remediation(&self) -> &str {
        match self {
            SecurityError::RiskExceeded { remediation, .. } => remediation,
            SecurityError::EscalationCommand { remediation, .. } => remediation,
        }
    }
}

/// Elevation failures. Restore failures never surface here: the process
/// aborts with exit code 3 before the error could propagate.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("unknown user '{user}'")]
    UnknownUser { user: String },

    #[error("unknown group '{group}'")]
    UnknownGroup { group: String },

    #[error("failed to switch effective ids to uid={uid} gid={gid}: {source}")]
    Elevate {
        uid: u32,
        gid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to restore effective ids")]
    RestoreFailed,
}

/// Spawn failure, output capture failure, output-path policy failure.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("command '{resource}': failed to spawn '{cmd}': {source}")]
    Spawn {
        resource: String,
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{resource}': error while capturing output: {source}")]
    Capture {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{resource}': output path '{path}' rejected: {reason}")]
    OutputPath {
        resource: String,
        path: String,
        reason: String,
    },

    #[error("command '{resource}': working directory '{path}' is unusable: {source}")]
    Workdir {
        resource: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Command exceeded its wall-clock deadline.
#[derive(Debug, Error)]
#[error("command '{resource}' exceeded its {seconds}s timeout")]
pub struct TimeoutError {
    pub resource: String,
    pub seconds: u64,
}

/// Unexpected OS failures outside any other kind.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("failed to create temporary working directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("unexpected i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
