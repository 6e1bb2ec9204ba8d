//! Group execution orchestration.
//!
//! Walks the runtime plan in declared order and runs every command through
//! the same gate: validation, digest verification of the resolved binary,
//! verification of the configured file set, risk evaluation, working
//! directory preparation, output-path policy. Only after the whole gate
//! passes does the command reach its mode-specific endpoint: a real spawn,
//! or a dry-run analysis record. Keeping both modes on one code path is
//! what makes dry-run output trustworthy.

pub mod capture;
pub mod dryrun;
pub mod spawn;

use crate::audit::Audit;
use crate::config::plan::{RuntimeCommand, RuntimeGroup, RuntimePlan};
use crate::digest::DigestStore;
use crate::errors::{ExecutionError, RunnerError, SystemError};
use crate::executor::dryrun::{DetailLevel, DryRunBuilder, DryRunResult};
use crate::executor::spawn::TerminationReason;
use crate::privilege::PrivilegeManager;
use crate::{risk, validate};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tokio::sync::watch;

/// Normal execution or dry-run analysis. Consumed by the orchestrator so
/// both paths share the gate and diverge only at the spawn point.
#[derive(Debug, Clone, Copy)]
pub enum ExecutionMode {
    Normal,
    DryRun {
        detail: DetailLevel,
        show_sensitive: bool,
    },
}

/// Outcome of one command, successful or not.
#[derive(Debug, Serialize)]
pub struct CommandRecord {
    pub resource: String,
    pub reason: TerminationReason,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub truncated: bool,
    pub duration_ns: u128,
    pub error: Option<String>,
}

impl CommandRecord {
    /// Whether this outcome halts a fail-fast group. Dry-run analyses
    /// carry no exit code; they fail only when the gate blocked them.
    #[must_use]
    pub fn failed(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        if !matches!(self.reason, TerminationReason::Exited) {
            return true;
        }
        matches!(self.exit_code, Some(code) if code != 0)
    }

    fn gate_failure(resource: &str, reason: TerminationReason, error: &RunnerError) -> Self {
        Self {
            resource: resource.to_string(),
            reason,
            exit_code: None,
            stdout: String::new(),
            truncated: false,
            duration_ns: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupRecord {
    pub name: String,
    pub commands: Vec<CommandRecord>,
    pub failed: bool,
}

/// Everything one run produced.
#[derive(Debug, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub groups: Vec<GroupRecord>,
    pub success: bool,
}

/// A run plus, in dry-run mode, the analysis artifact.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: RunResult,
    pub analysis: Option<DryRunResult>,
}

/// The orchestrator for one run over one plan.
pub struct Executor<'a> {
    plan: &'a RuntimePlan,
    store: &'a DigestStore,
    privileges: &'a PrivilegeManager,
    audit: Audit,
    shutdown: watch::Receiver<bool>,
}

impl<'a> Executor<'a> {
    #[must_use]
    pub fn new(
        plan: &'a RuntimePlan,
        store: &'a DigestStore,
        privileges: &'a PrivilegeManager,
        audit: Audit,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            plan,
            store,
            privileges,
            audit,
            shutdown,
        }
    }

    /// Execute (or analyze) every group in declared order. Groups after a
    /// failed one are skipped unless the run continues on group failure.
    pub async fn execute(&self, mode: ExecutionMode) -> Result<RunOutcome, RunnerError> {
        let mut builder = match mode {
            ExecutionMode::Normal => None,
            ExecutionMode::DryRun {
                detail,
                show_sensitive,
            } => {
                let mut b = DryRunBuilder::new(detail, show_sensitive, self.audit.run_id());
                b.global(&self.plan.global);
                Some(b)
            }
        };

        let mut groups = Vec::with_capacity(self.plan.groups.len());
        let mut halted = false;
        for group in &self.plan.groups {
            if halted {
                if let Some(b) = builder.as_mut() {
                    for rc in &group.commands {
                        b.command_skipped(rc);
                    }
                }
                continue;
            }
            let record = self.execute_group(group, mode, builder.as_mut()).await?;
            if record.failed && !self.plan.continue_on_group_failure {
                halted = true;
            }
            groups.push(record);
        }

        let success = groups.iter().all(|g| !g.failed);
        Ok(RunOutcome {
            run: RunResult {
                run_id: self.audit.run_id().to_string(),
                groups,
                success,
            },
            analysis: builder.map(DryRunBuilder::finish),
        })
    }

    async fn execute_group(
        &self,
        group: &RuntimeGroup,
        mode: ExecutionMode,
        mut builder: Option<&mut DryRunBuilder>,
    ) -> Result<GroupRecord, RunnerError> {
        if let Some(b) = builder.as_mut() {
            b.group(group, &self.plan.global);
        }

        // A group without a workdir gets a private temporary one, mode
        // 0700, removed after the group unless it asked to keep it.
        // Dry-run never touches the filesystem.
        let needs_temp = group.workdir.is_none()
            && group.commands.iter().any(|c| c.workdir.is_none());
        let temp_dir = match (mode, needs_temp) {
            (ExecutionMode::Normal, true) => Some(
                tempfile::Builder::new()
                    .prefix("saferun-")
                    .tempdir()
                    .map_err(|e| RunnerError::from(SystemError::TempDir(e)))?,
            ),
            _ => None,
        };

        let mut commands = Vec::with_capacity(group.commands.len());
        let mut halt = false;
        for rc in &group.commands {
            if halt {
                if let Some(b) = builder.as_mut() {
                    b.command_skipped(rc);
                }
                continue;
            }

            let record = self
                .run_one(
                    rc,
                    group,
                    temp_dir.as_ref().map(|t| t.path()),
                    mode,
                    builder.as_deref_mut(),
                )
                .await;
            if record.failed() && group.fail_fast {
                halt = true;
            }
            commands.push(record);
        }

        if let Some(temp) = temp_dir {
            if group.keep_temp_dirs {
                let kept = temp.keep();
                tracing::debug!(group = %group.name, path = %kept.display(), "kept temp dir");
            }
            // Otherwise dropped here, which removes it.
        }

        let failed = commands.iter().any(CommandRecord::failed);
        Ok(GroupRecord {
            name: group.name.clone(),
            commands,
            failed,
        })
    }

    /// The per-command gate, then the mode-specific endpoint.
    async fn run_one(
        &self,
        rc: &RuntimeCommand,
        group: &RuntimeGroup,
        temp_dir: Option<&Path>,
        mode: ExecutionMode,
        mut builder: Option<&mut DryRunBuilder>,
    ) -> CommandRecord {
        let resource = rc.resource();

        // Gate 1: validation over the materialized command.
        if let Err(e) = validate::validate_command(rc, &self.plan.global.allow_unsafe_env) {
            if let Some(b) = builder.as_mut() {
                b.command_blocked(rc, TerminationReason::ValidationFailed, &e);
            }
            return CommandRecord::gate_failure(&resource, TerminationReason::ValidationFailed, &e);
        }
        let Some(cmd_path) = rc.resolved_cmd.clone() else {
            // The validator rejects unresolved commands; this is a plain
            // defensive return for the type system.
            let e = RunnerError::from(crate::errors::ValidationError::CommandNotFound {
                resource: resource.clone(),
                cmd: rc.cmd.clone(),
            });
            return CommandRecord::gate_failure(&resource, TerminationReason::ValidationFailed, &e);
        };

        // Gate 2: digest of the binary about to run.
        if let Err(e) = self.store.verify(&cmd_path) {
            self.audit.verification_failed(&cmd_path, &e.to_string());
            let e = RunnerError::from(e);
            if let Some(b) = builder.as_mut() {
                b.file_failed(&cmd_path, &e.to_string());
                b.command_blocked(rc, TerminationReason::VerificationFailed, &e);
            }
            return CommandRecord::gate_failure(
                &resource,
                TerminationReason::VerificationFailed,
                &e,
            );
        }
        if let Some(b) = builder.as_mut() {
            b.file_verified(&cmd_path);
        }

        // Gate 3: the configured verification set (global + group).
        for path in self
            .plan
            .global
            .verify_files
            .iter()
            .chain(group.verify_files.iter())
        {
            match self.store.verify(path) {
                Ok(()) => {
                    if let Some(b) = builder.as_mut() {
                        b.file_verified(path);
                    }
                }
                Err(e) => {
                    self.audit.verification_failed(path, &e.to_string());
                    let e = RunnerError::from(e);
                    if let Some(b) = builder.as_mut() {
                        b.file_failed(path, &e.to_string());
                        b.command_blocked(rc, TerminationReason::VerificationFailed, &e);
                    }
                    return CommandRecord::gate_failure(
                        &resource,
                        TerminationReason::VerificationFailed,
                        &e,
                    );
                }
            }
        }

        // Gate 4: risk classification against the command's policy.
        let assessment = match risk::gate(
            &resource,
            &cmd_path,
            &rc.args,
            rc.max_risk_level,
            rc.privileged,
        ) {
            Ok(assessment) => assessment,
            Err(e) => {
                let (level, pattern, description) = match &e {
                    RunnerError::Security(sec) => match sec {
                        crate::errors::SecurityError::RiskExceeded {
                            actual,
                            description,
                            ..
                        } => (actual.clone(), String::new(), description.clone()),
                        crate::errors::SecurityError::EscalationCommand {
                            pattern, ..
                        } => ("critical".to_string(), pattern.clone(), "Privilege escalation command".to_string()),
                    },
                    _ => (String::new(), String::new(), String::new()),
                };
                self.audit.risk_blocked(&resource, &level, &pattern);
                if let Some(b) = builder.as_mut() {
                    b.security_finding(&resource, &level, &description, &pattern);
                    b.command_blocked(rc, TerminationReason::RiskBlocked, &e);
                }
                return CommandRecord::gate_failure(&resource, TerminationReason::RiskBlocked, &e);
            }
        };
        if let Some(finding) = &assessment.finding {
            if let Some(b) = builder.as_mut() {
                b.security_finding(
                    &resource,
                    &finding.level.to_string(),
                    finding.description,
                    &finding.pattern,
                );
            }
        }

        // Gate 5: output-path ancestry policy.
        if let Some(output) = &rc.output {
            if let Err(e) = validate_output_path(&resource, output) {
                if let Some(b) = builder.as_mut() {
                    b.command_blocked(rc, TerminationReason::OutputError, &e);
                }
                return CommandRecord::gate_failure(&resource, TerminationReason::OutputError, &e);
            }
        }

        let workdir: Option<PathBuf> = rc
            .workdir
            .clone()
            .or_else(|| group.workdir.clone())
            .or_else(|| temp_dir.map(Path::to_path_buf));

        match mode {
            ExecutionMode::DryRun { .. } => {
                if let Some(b) = builder.as_mut() {
                    b.command_ok(rc, &assessment);
                }
                CommandRecord {
                    resource,
                    reason: TerminationReason::Exited,
                    exit_code: None,
                    stdout: String::new(),
                    truncated: false,
                    duration_ns: 0,
                    error: None,
                }
            }
            ExecutionMode::Normal => {
                match spawn::run_command(
                    rc,
                    &cmd_path,
                    workdir.as_deref(),
                    self.privileges,
                    &self.audit,
                    self.shutdown.clone(),
                )
                .await
                {
                    Ok(result) => CommandRecord {
                        resource,
                        reason: result.reason,
                        exit_code: Some(result.exit_code),
                        stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                        truncated: result.truncated,
                        duration_ns: result.duration.as_nanos(),
                        error: None,
                    },
                    Err(e) => {
                        let reason = match &e {
                            RunnerError::Privilege(_) => TerminationReason::PrivilegeError,
                            RunnerError::Execution(ExecutionError::OutputPath { .. }) => {
                                TerminationReason::OutputError
                            }
                            _ => TerminationReason::Exited,
                        };
                        let mut record = CommandRecord::gate_failure(&resource, reason, &e);
                        record.exit_code = Some(-1);
                        record
                    }
                }
            }
        }
    }
}

/// Output files may only live under directories the caller can trust: any
/// ancestor that is group-writable by a group the real uid does not belong
/// to is rejected. World-writable directories with the sticky bit (/tmp
/// and friends) are accepted; sticky semantics prevent the substitution
/// attacks this check exists for.
pub fn validate_output_path(resource: &str, output: &Path) -> Result<(), RunnerError> {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::PermissionsExt;

    let parent = output.parent().unwrap_or(Path::new("/"));
    let caller_uid = nix::unistd::getuid().as_raw();
    let mut caller_gids: Vec<u32> = nix::unistd::getgroups()
        .map(|gs| gs.iter().map(|g| g.as_raw()).collect())
        .unwrap_or_default();
    caller_gids.push(nix::unistd::getgid().as_raw());

    let mut current = PathBuf::from("/");
    for comp in parent.components() {
        if let Component::Normal(part) = comp {
            current.push(part);
        } else {
            continue;
        }

        let meta = std::fs::metadata(&current).map_err(|_| {
            RunnerError::from(ExecutionError::OutputPath {
                resource: resource.to_string(),
                path: output.to_string_lossy().into_owned(),
                reason: format!("directory '{}' does not exist", current.display()),
            })
        })?;

        let mode = meta.permissions().mode();
        let sticky = mode & 0o1000 != 0;
        let group_writable = mode & 0o020 != 0;
        if group_writable
            && !sticky
            && meta.uid() != caller_uid
            && !caller_gids.contains(&meta.gid())
        {
            return Err(ExecutionError::OutputPath {
                resource: resource.to_string(),
                path: output.to_string_lossy().into_owned(),
                reason: format!(
                    "directory '{}' is writable by group {} which the caller does not belong to",
                    current.display(),
                    meta.gid()
                ),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Audit;
    use crate::config::{self, plan::materialize};
    use indexmap::IndexMap;
    use std::path::Path;

    const ECHO: &str = "/usr/bin/echo";
    const SLEEP: &str = "/usr/bin/sleep";
    const RM: &str = "/usr/bin/rm";
    const FALSE: &str = "/usr/bin/false";

    struct Harness {
        _hash_dir: tempfile::TempDir,
        store: DigestStore,
        privileges: PrivilegeManager,
    }

    impl Harness {
        fn new(binaries: &[&str]) -> Self {
            let hash_dir = tempfile::tempdir().unwrap();
            let store = DigestStore::with_root(hash_dir.path());
            for bin in binaries {
                store.record(Path::new(bin), false).unwrap();
            }
            Self {
                _hash_dir: hash_dir,
                store,
                privileges: PrivilegeManager::new(),
            }
        }

        async fn run(&self, text: &str, sys: &[(&str, &str)], mode: ExecutionMode) -> RunOutcome {
            let config = config::parse(text.as_bytes()).unwrap();
            let system: IndexMap<String, String> = sys
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let plan = materialize(&config, &system).unwrap();
            let (_tx, rx) = tokio::sync::watch::channel(false);
            let executor = Executor::new(
                &plan,
                &self.store,
                &self.privileges,
                Audit::new("test-run"),
                rx,
            );
            executor.execute(mode).await.unwrap()
        }
    }

    // -----------------------------------------------------------------------
    // Normal execution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_happy_path_captures_stdout() {
        let harness = Harness::new(&[ECHO]);
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "build"

[[groups.commands]]
name = "echo"
cmd = "{ECHO}"
args = ["ok"]
"#
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(outcome.run.success);
        let cmd = &outcome.run.groups[0].commands[0];
        assert_eq!(cmd.exit_code, Some(0));
        assert_eq!(cmd.stdout, "ok\n");
        assert_eq!(cmd.reason, TerminationReason::Exited);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_group() {
        let harness = Harness::new(&[FALSE, ECHO]);
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "build"

[[groups.commands]]
name = "fails"
cmd = "{FALSE}"

[[groups.commands]]
name = "never"
cmd = "{ECHO}"
args = ["unreachable"]
"#
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(!outcome.run.success);
        // Fail-fast: the second command never ran.
        assert_eq!(outcome.run.groups[0].commands.len(), 1);
    }

    #[tokio::test]
    async fn test_verification_failure_halts_group() {
        let harness = Harness::new(&[ECHO]);
        // SLEEP was never recorded: its digest lookup fails.
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "build"

[[groups.commands]]
name = "first"
cmd = "{SLEEP}"
args = ["0"]

[[groups.commands]]
name = "second"
cmd = "{ECHO}"
args = ["unreachable"]
"#
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(!outcome.run.success);
        let group = &outcome.run.groups[0];
        assert_eq!(group.commands[0].reason, TerminationReason::VerificationFailed);
        assert_eq!(group.commands.len(), 1);
    }

    #[tokio::test]
    async fn test_verification_failure_skips_later_groups() {
        let harness = Harness::new(&[ECHO]);
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "broken"

[[groups.commands]]
name = "first"
cmd = "{SLEEP}"
args = ["0"]

[[groups]]
name = "after"

[[groups.commands]]
name = "echo"
cmd = "{ECHO}"
args = ["unreachable"]
"#
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(!outcome.run.success);
        assert_eq!(outcome.run.groups.len(), 1);
    }

    #[tokio::test]
    async fn test_risk_blocked_without_spawn() {
        let harness = Harness::new(&[RM]);
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "clean"

[[groups.commands]]
name = "wipe"
cmd = "{RM}"
args = ["-rf", "/tmp/saferun-test-never-exists"]
"#
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(!outcome.run.success);
        let cmd = &outcome.run.groups[0].commands[0];
        assert_eq!(cmd.reason, TerminationReason::RiskBlocked);
        let error = cmd.error.as_deref().unwrap();
        assert!(error.contains("Recursive file removal"), "error: {error}");
    }

    #[tokio::test]
    async fn test_timeout_terminates_command() {
        let harness = Harness::new(&[SLEEP]);
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "slow"

[[groups.commands]]
name = "nap"
cmd = "{SLEEP}"
args = ["30"]
timeout = 1
"#
        );
        let start = std::time::Instant::now();
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        let cmd = &outcome.run.groups[0].commands[0];
        assert_eq!(cmd.reason, TerminationReason::Timeout);
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_output_file_and_truncation() {
        let harness = Harness::new(&[ECHO]);
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("captured.log");
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "build"

[[groups.commands]]
name = "echo"
cmd = "{ECHO}"
args = ["hello world"]
output = "{}"
output_size_limit = 5
"#,
            out_path.display()
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        let cmd = &outcome.run.groups[0].commands[0];
        assert!(cmd.truncated);
        assert_eq!(cmd.stdout, "hello");
        assert_eq!(std::fs::read(&out_path).unwrap(), b"hello");
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&out_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_continue_on_group_failure() {
        let harness = Harness::new(&[FALSE, ECHO]);
        let text = format!(
            r#"
version = "1.0"
continue_on_group_failure = true

[[groups]]
name = "broken"

[[groups.commands]]
name = "fails"
cmd = "{FALSE}"

[[groups]]
name = "after"

[[groups.commands]]
name = "echo"
cmd = "{ECHO}"
args = ["still runs"]
"#
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(!outcome.run.success);
        assert_eq!(outcome.run.groups.len(), 2);
        assert_eq!(outcome.run.groups[1].commands[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_group_verify_files_checked() {
        let harness = Harness::new(&[ECHO]);
        let data_dir = tempfile::tempdir().unwrap();
        let watched = data_dir.path().join("config.dat");
        std::fs::write(&watched, b"v1").unwrap();
        harness.store.record(&watched, false).unwrap();

        // Tamper after recording.
        std::fs::write(&watched, b"v2").unwrap();

        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "build"
verify_files = ["{}"]

[[groups.commands]]
name = "echo"
cmd = "{ECHO}"
args = ["ok"]
"#,
            watched.display()
        );
        let outcome = harness.run(&text, &[], ExecutionMode::Normal).await;

        assert!(!outcome.run.success);
        assert_eq!(
            outcome.run.groups[0].commands[0].reason,
            TerminationReason::VerificationFailed
        );
    }

    // -----------------------------------------------------------------------
    // Dry-run analysis
    // -----------------------------------------------------------------------

    const OVERRIDE_CHAIN: &str = r#"
version = "1.0"

[global]
vars = { APP_ENV = "production" }

[[groups]]
name = "deploy"
vars = { APP_ENV = "staging" }

[[groups.commands]]
name = "push"
cmd = "/usr/bin/echo"
env_vars = ["APP_ENV=test", "DB_PASSWORD=hunter2", "KEYWORDS=alpha,beta"]
"#;

    #[tokio::test]
    async fn test_dry_run_does_not_execute() {
        let harness = Harness::new(&[ECHO]);
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("never-created.log");
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "build"

[[groups.commands]]
name = "echo"
cmd = "{ECHO}"
args = ["ok"]
output = "{}"
"#,
            out_path.display()
        );
        let outcome = harness
            .run(
                &text,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Summary,
                    show_sensitive: false,
                },
            )
            .await;

        assert!(outcome.run.success);
        assert!(!out_path.exists());
        let analysis = outcome.analysis.unwrap();
        assert_eq!(analysis.summary.commands_analyzed, 1);
        assert_eq!(analysis.status, "ok");
    }

    #[tokio::test]
    async fn test_dry_run_detail_levels_are_additive() {
        let harness = Harness::new(&[ECHO]);

        let summary = harness
            .run(
                OVERRIDE_CHAIN,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Summary,
                    show_sensitive: false,
                },
            )
            .await
            .analysis
            .unwrap();
        assert!(summary
            .resource_analyses
            .iter()
            .all(|r| r.debug_info.is_none()));

        let detailed = harness
            .run(
                OVERRIDE_CHAIN,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Detailed,
                    show_sensitive: false,
                },
            )
            .await
            .analysis
            .unwrap();
        let group = detailed
            .resource_analyses
            .iter()
            .find(|r| r.kind == "group")
            .unwrap();
        assert!(group.debug_info.as_ref().unwrap().inheritance_analysis.is_some());
        let command = detailed
            .resource_analyses
            .iter()
            .find(|r| r.kind == "command")
            .unwrap();
        assert!(command.debug_info.is_none());

        let full = harness
            .run(
                OVERRIDE_CHAIN,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Full,
                    show_sensitive: false,
                },
            )
            .await
            .analysis
            .unwrap();
        let command = full
            .resource_analyses
            .iter()
            .find(|r| r.kind == "command")
            .unwrap();
        assert!(
            command
                .debug_info
                .as_ref()
                .unwrap()
                .final_environment
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_dry_run_full_reports_origins_and_redaction() {
        let harness = Harness::new(&[ECHO]);
        let full = harness
            .run(
                OVERRIDE_CHAIN,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Full,
                    show_sensitive: false,
                },
            )
            .await
            .analysis
            .unwrap();

        let command = full
            .resource_analyses
            .iter()
            .find(|r| r.kind == "command")
            .unwrap();
        let env = command
            .debug_info
            .as_ref()
            .unwrap()
            .final_environment
            .as_ref()
            .unwrap();

        // Command-level override wins and its origin says so.
        let app_env = env.variables.get("APP_ENV").unwrap();
        assert_eq!(app_env.value, "test");
        assert_eq!(app_env.source, "Command[push]");
        assert_eq!(app_env.masked, None);

        // Sensitive names are redacted; near-misses are not.
        let password = env.variables.get("DB_PASSWORD").unwrap();
        assert_eq!(password.value, dryrun::REDACTION_MARKER);
        assert_eq!(password.masked, Some(true));
        let keywords = env.variables.get("KEYWORDS").unwrap();
        assert_eq!(keywords.value, "alpha,beta");
        assert_eq!(keywords.masked, None);
    }

    #[tokio::test]
    async fn test_dry_run_show_sensitive_disables_redaction() {
        let harness = Harness::new(&[ECHO]);
        let full = harness
            .run(
                OVERRIDE_CHAIN,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Full,
                    show_sensitive: true,
                },
            )
            .await
            .analysis
            .unwrap();

        let command = full
            .resource_analyses
            .iter()
            .find(|r| r.kind == "command")
            .unwrap();
        let env = command
            .debug_info
            .as_ref()
            .unwrap()
            .final_environment
            .as_ref()
            .unwrap();
        assert_eq!(env.variables.get("DB_PASSWORD").unwrap().value, "hunter2");
    }

    #[tokio::test]
    async fn test_dry_run_gate_failures_reported() {
        let harness = Harness::new(&[RM]);
        let text = format!(
            r#"
version = "1.0"

[[groups]]
name = "clean"

[[groups.commands]]
name = "wipe"
cmd = "{RM}"
args = ["-rf", "/tmp/x"]

[[groups.commands]]
name = "after"
cmd = "{RM}"
args = ["--version"]
"#
        );
        let outcome = harness
            .run(
                &text,
                &[],
                ExecutionMode::DryRun {
                    detail: DetailLevel::Summary,
                    show_sensitive: false,
                },
            )
            .await;

        let analysis = outcome.analysis.unwrap();
        assert_eq!(analysis.status, "issues_found");
        assert_eq!(analysis.summary.commands_blocked, 1);
        assert_eq!(analysis.summary.commands_skipped, 1);
        assert!(!analysis.security_analysis.findings.is_empty());
    }

    // -----------------------------------------------------------------------
    // Output-path policy
    // -----------------------------------------------------------------------

    #[test]
    fn test_output_path_under_home_style_dir_accepted() {
        let dir = tempfile::tempdir().unwrap();
        validate_output_path("g.c", &dir.path().join("out.log")).unwrap();
    }

    #[test]
    fn test_output_path_with_missing_parent_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            validate_output_path("g.c", &dir.path().join("missing/out.log")).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Execution(ExecutionError::OutputPath { .. })
        ));
    }
}
