//! Child process spawning, waiting, and termination.
//!
//! The child runs in its own session (setsid) so timeout and cancellation
//! can signal the whole process group. Stdin is always null; stdout is
//! piped into the bounded capture; stderr passes through to the runner's
//! own stderr. When `run_as_user`/`run_as_group` is set, the spawn happens
//! inside a privilege bracket and the child's credentials are set via the
//! process attributes, so the parent restores its own ids the instant the
//! child has started while the child keeps the target identity.

use crate::audit::Audit;
use crate::config::plan::RuntimeCommand;
use crate::errors::{ExecutionError, RunnerError};
use crate::executor::capture::{self, CaptureResult};
use crate::privilege::{ElevationRequest, PrivilegeManager, resolve_group, resolve_user};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// How long a child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Why a command stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Exited,
    Timeout,
    Signaled,
    ValidationFailed,
    VerificationFailed,
    RiskBlocked,
    PrivilegeError,
    OutputError,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TerminationReason::Exited => "exited",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Signaled => "signaled",
            TerminationReason::ValidationFailed => "validation_failed",
            TerminationReason::VerificationFailed => "verification_failed",
            TerminationReason::RiskBlocked => "risk_blocked",
            TerminationReason::PrivilegeError => "privilege_error",
            TerminationReason::OutputError => "output_error",
        };
        write!(f, "{label}")
    }
}

/// Result of one completed spawn.
#[derive(Debug)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub truncated: bool,
    pub duration: Duration,
    pub reason: TerminationReason,
}

/// Spawn the command and wait for it to finish, enforcing the timeout and
/// reacting to run cancellation. `cmd_path` is the gate-verified resolved
/// binary; `workdir` the effective working directory for the child.
pub async fn run_command(
    rc: &RuntimeCommand,
    cmd_path: &Path,
    workdir: Option<&Path>,
    privileges: &PrivilegeManager,
    audit: &Audit,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ExecutionResult, RunnerError> {
    let resource = rc.resource();
    let start = Instant::now();

    // The output file is created by the real uid, before any elevation.
    let tee = match &rc.output {
        Some(path) => Some(crate::safefile::safe_create(path).map_err(|e| {
            RunnerError::from(ExecutionError::OutputPath {
                resource: resource.clone(),
                path: path.to_string_lossy().into_owned(),
                reason: e.to_string(),
            })
        })?),
        None => None,
    };

    let elevation = resolve_elevation(rc)?;

    let mut cmd = Command::new(cmd_path);
    cmd.args(&rc.args);
    cmd.env_clear();
    cmd.envs(&rc.env.env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    if let Some(req) = &elevation {
        cmd.uid(req.uid);
        cmd.gid(req.gid);
    }

    // Start a new session so the whole process group can be signaled.
    // SAFETY: pre_exec runs before exec in the child process.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    audit.command_start(&resource, &cmd_path.to_string_lossy());

    // Fork-exec, bracketed by the privilege manager when elevating. The
    // bracket closes as soon as spawn returns: the child inherited the
    // target credentials, the parent goes back to its own.
    let spawned = match &elevation {
        Some(req) => privileges.with_privileges(req, audit, || cmd.spawn())?,
        None => cmd.spawn(),
    };
    let mut child = spawned.map_err(|source| {
        RunnerError::from(ExecutionError::Spawn {
            resource: resource.clone(),
            cmd: cmd_path.to_string_lossy().into_owned(),
            source,
        })
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let reader = tokio::spawn(capture::capture_stdout(
        stdout,
        rc.output_size_limit,
        tee,
    ));

    let outcome = wait_with_deadline(&mut child, rc.timeout, &mut shutdown).await;

    let capture = match reader.await {
        Ok(Ok(capture)) => capture,
        Ok(Err(source)) => {
            return Err(ExecutionError::Capture {
                resource: resource.clone(),
                source,
            }
            .into());
        }
        Err(join_err) => {
            return Err(ExecutionError::Capture {
                resource: resource.clone(),
                source: std::io::Error::other(join_err),
            }
            .into());
        }
    };

    let duration = start.elapsed();
    let result = build_result(outcome, capture, duration);
    audit.command_end(
        &resource,
        result.exit_code,
        duration.as_millis(),
        &result.reason.to_string(),
    );
    Ok(result)
}

/// Target identity for the spawn, if the command asks for one.
fn resolve_elevation(rc: &RuntimeCommand) -> Result<Option<ElevationRequest>, RunnerError> {
    if rc.run_as_user.is_none() && rc.run_as_group.is_none() {
        return Ok(None);
    }

    let (uid, primary_gid) = match &rc.run_as_user {
        Some(user) => resolve_user(user)?,
        None => (
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        ),
    };
    let gid = match &rc.run_as_group {
        Some(group) => resolve_group(group)?,
        None => primary_gid,
    };

    Ok(Some(ElevationRequest {
        uid,
        gid,
        resource: rc.resource(),
        user: rc.run_as_user.clone().unwrap_or_default(),
    }))
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    Deadline,
    Cancelled,
}

/// Wait for the child, racing the timeout and run cancellation. Either of
/// the latter terminates the process group: SIGTERM, a bounded grace
/// period, then SIGKILL.
async fn wait_with_deadline(
    child: &mut Child,
    timeout_secs: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> WaitOutcome {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => return WaitOutcome::Exited(status),
            Err(_) => return WaitOutcome::Cancelled,
        },
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => WaitOutcome::Deadline,
        _ = shutdown.changed() => WaitOutcome::Cancelled,
    };

    let _ = signal_group(child, nix::sys::signal::Signal::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = signal_group(child, nix::sys::signal::Signal::SIGKILL);
        let _ = child.wait().await;
    }
    outcome
}

/// Signal the child's process group (it leads one, courtesy of setsid).
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) -> Result<(), String> {
    let pid = child
        .id()
        .ok_or_else(|| "process has no PID (already exited?)".to_string())?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pid as i32)), signal)
        .map_err(|e| format!("failed to signal process group: {e}"))
}

fn build_result(
    outcome: WaitOutcome,
    capture: CaptureResult,
    duration: Duration,
) -> ExecutionResult {
    use std::os::unix::process::ExitStatusExt;

    let (exit_code, reason) = match outcome {
        WaitOutcome::Exited(status) => match status.code() {
            Some(code) => (code, TerminationReason::Exited),
            None => (
                status.signal().map(|s| 128 + s).unwrap_or(-1),
                TerminationReason::Signaled,
            ),
        },
        WaitOutcome::Deadline => (-1, TerminationReason::Timeout),
        WaitOutcome::Cancelled => (-1, TerminationReason::Signaled),
    };

    ExecutionResult {
        exit_code,
        stdout: capture.bytes,
        truncated: capture.truncated,
        duration,
        reason,
    }
}
