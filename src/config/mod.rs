//! Declarative configuration: TOML schema and the verified loader.
//!
//! Loading is read-verify-parse as one operation over one buffer: the file
//! is opened through safe file access, streamed into memory, its SHA-256
//! checked against the digest store, and only then decoded. The bytes that
//! were hashed are the bytes that get parsed, so swapping the file between
//! verification and parse buys an attacker nothing.

pub mod plan;
pub mod template;
pub mod vars;

use crate::digest::DigestStore;
use crate::errors::{ConfigurationError, RunnerError};
use crate::risk::RiskLevel;
use crate::safefile;
use indexmap::IndexMap;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

/// Root of the decoded configuration tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub continue_on_group_failure: bool,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub templates: IndexMap<String, TemplateConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Global block: defaults and baselines every group inherits.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Wall-clock ceiling per command, seconds.
    pub timeout: Option<u64>,
    pub log_level: Option<String>,
    /// Baseline set of system variables allowed to reach commands.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default)]
    pub verify_files: Vec<String>,
    #[serde(default)]
    pub vars: IndexMap<String, String>,
    /// System variables imported into the global vars layer (still subject
    /// to the allowlist).
    #[serde(default)]
    pub env_import: Vec<String>,
    /// Environment names exempt from the injection-vector rejection
    /// (LD_PRELOAD and friends).
    #[serde(default)]
    pub allow_unsafe_env: Vec<String>,
}

/// One ordered group of commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    pub description: Option<String>,
    pub workdir: Option<String>,
    pub priority: Option<i64>,
    /// Absent = inherit the global allowlist; present and empty = reject
    /// all system variables; present and non-empty = replace.
    pub env_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub vars: IndexMap<String, String>,
    #[serde(default)]
    pub env_import: Vec<String>,
    #[serde(default)]
    pub verify_files: Vec<String>,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
    #[serde(default)]
    pub keep_temp_dirs: bool,
    /// When false, a failed command does not halt the rest of the group.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

/// One command: either a direct `cmd` or a `template` reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub name: String,
    pub description: Option<String>,
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// KEY=VALUE entries layered on top of group/global environment.
    #[serde(default)]
    pub env_vars: Vec<String>,
    pub template: Option<String>,
    #[serde(default)]
    pub params: IndexMap<String, toml::Value>,
    pub workdir: Option<String>,
    pub timeout: Option<u64>,
    pub run_as_user: Option<String>,
    pub run_as_group: Option<String>,
    pub max_risk_level: Option<RiskLevel>,
    pub output: Option<String>,
    pub output_size_limit: Option<u64>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub vars: IndexMap<String, String>,
}

/// Reusable parameterized command definition at root scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<String>,
    pub workdir: Option<String>,
    pub timeout: Option<u64>,
    pub output_size_limit: Option<u64>,
    pub risk_level: Option<RiskLevel>,
}

fn default_true() -> bool {
    true
}

/// Read and verify the configuration in one logical operation.
///
/// The returned tree is decoded but not yet validated; validation and
/// expansion happen during plan materialization.
pub fn load_verified(path: &Path, store: &DigestStore) -> Result<Config, RunnerError> {
    let mut file = safefile::safe_open(path).map_err(|e| {
        RunnerError::from(crate::errors::VerificationError::UnsafePath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    })?;

    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).map_err(|source| {
        RunnerError::from(crate::errors::VerificationError::Io {
            path: path.to_path_buf(),
            source,
        })
    })?;

    // Verify the exact bytes that will be parsed. No reopen, no second read.
    store.verify_content(path, &buffer)?;

    parse(&buffer)
}

/// Decode a configuration buffer. Split out so tests can parse without a
/// digest store.
pub fn parse(buffer: &[u8]) -> Result<Config, RunnerError> {
    let text = std::str::from_utf8(buffer)
        .map_err(|_| RunnerError::from(ConfigurationError::Encoding))?;
    let config: Config =
        toml::from_str(text).map_err(|e| RunnerError::from(ConfigurationError::Syntax(e)))?;
    if config.version.trim().is_empty() {
        return Err(ConfigurationError::MissingVersion.into());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RunnerError, VerificationError};

    fn write_config(dir: &tempfile::TempDir, text: &str) -> std::path::PathBuf {
        let path = dir.path().join("run.toml");
        std::fs::write(&path, text).unwrap();
        path
    }

    const MINIMAL: &str = "version = \"1.0\"\n";

    #[test]
    fn test_load_verified_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir, MINIMAL);
        let store = DigestStore::with_root(dir.path());
        store.record(&config_path, false).unwrap();

        let config = load_verified(&config_path, &store).unwrap();
        assert_eq!(config.version, "1.0");
    }

    #[test]
    fn test_load_verified_rejects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir, MINIMAL);
        let store = DigestStore::with_root(dir.path());
        store.record(&config_path, false).unwrap();

        std::fs::write(&config_path, "version = \"1.0\"\n# tampered\n").unwrap();
        let err = load_verified(&config_path, &store).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Verification(VerificationError::Failed { .. })
        ));
    }

    #[test]
    fn test_load_verified_requires_recorded_digest() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir, MINIMAL);
        let store = DigestStore::with_root(dir.path());

        let err = load_verified(&config_path, &store).unwrap_err();
        assert!(matches!(err, RunnerError::Verification(_)));
    }

    #[test]
    fn test_load_verified_refuses_symlinked_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir, MINIMAL);
        let link = dir.path().join("link.toml");
        std::os::unix::fs::symlink(&config_path, &link).unwrap();
        let store = DigestStore::with_root(dir.path());
        store.record(&config_path, false).unwrap();

        let err = load_verified(&link, &store).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Verification(VerificationError::UnsafePath { .. })
        ));
    }

    #[test]
    fn test_verification_precedes_parse() {
        // A file that is both tampered and syntactically broken must fail
        // verification, proving the digest check runs before the decoder.
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_config(&dir, MINIMAL);
        let store = DigestStore::with_root(dir.path());
        store.record(&config_path, false).unwrap();

        std::fs::write(&config_path, "version = [broken").unwrap();
        let err = load_verified(&config_path, &store).unwrap_err();
        assert!(matches!(err, RunnerError::Verification(_)));
    }
}
