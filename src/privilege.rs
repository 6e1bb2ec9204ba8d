//! Controlled effective-UID/GID switching around a command spawn.
//!
//! One operation: bracket a closure with an elevation to a target identity
//! and an unconditional restoration afterwards. A single process-wide
//! mutex serializes every bracket, so two commands never run elevated at
//! the same time. If restoration fails the process terminates immediately
//! with a distinct exit code: a leaked elevation must never keep running.
//! That abort is the only place in the codebase allowed to exit without
//! returning an error.
//!
//! The raw syscalls sit behind a small trait so the restore-failure path
//! and the exclusivity invariant are testable without root.

use crate::audit::Audit;
use crate::errors::{PrivilegeError, RunnerError};
use std::sync::Mutex;

/// Exit code used when effective-id restoration fails.
pub const EXIT_PRIVILEGE_RESTORE: i32 = 3;

/// The identity syscalls the manager needs.
pub trait IdentityOps: Send + Sync {
    fn effective_uid(&self) -> u32;
    fn effective_gid(&self) -> u32;
    fn set_effective_uid(&self, uid: u32) -> std::io::Result<()>;
    fn set_effective_gid(&self, gid: u32) -> std::io::Result<()>;
}

/// Production implementation over seteuid/setegid.
struct SystemIdentity;

impl IdentityOps for SystemIdentity {
    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn effective_gid(&self) -> u32 {
        nix::unistd::getegid().as_raw()
    }

    fn set_effective_uid(&self, uid: u32) -> std::io::Result<()> {
        nix::unistd::seteuid(nix::unistd::Uid::from_raw(uid)).map_err(std::io::Error::from)
    }

    fn set_effective_gid(&self, gid: u32) -> std::io::Result<()> {
        nix::unistd::setegid(nix::unistd::Gid::from_raw(gid)).map_err(std::io::Error::from)
    }
}

/// Target identity and context for one elevation.
#[derive(Debug, Clone)]
pub struct ElevationRequest {
    pub uid: u32,
    pub gid: u32,
    /// `group.command` of the command being run.
    pub resource: String,
    /// The configured `run_as_user` name, for audit records.
    pub user: String,
}

/// Process-wide privilege bracket. Constructed once, before any group
/// starts executing.
pub struct PrivilegeManager {
    ops: Box<dyn IdentityOps>,
    lock: Mutex<()>,
    abort: Box<dyn Fn() + Send + Sync>,
}

impl PrivilegeManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Box::new(SystemIdentity),
            lock: Mutex::new(()),
            abort: Box::new(|| std::process::exit(EXIT_PRIVILEGE_RESTORE)),
        }
    }

    /// Build a manager with stubbed syscalls and abort handler.
    #[cfg(any(test, feature = "testing"))]
    #[must_use]
    pub fn with_ops(ops: Box<dyn IdentityOps>, abort: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            ops,
            lock: Mutex::new(()),
            abort,
        }
    }

    /// Run `f` with effective ids switched to the request's target.
    ///
    /// Whatever `f` returns is propagated unchanged. The saved ids are
    /// restored unconditionally afterwards; a failed restoration aborts
    /// the process after the final audit record.
    pub fn with_privileges<T>(
        &self,
        request: &ElevationRequest,
        audit: &Audit,
        f: impl FnOnce() -> T,
    ) -> Result<T, RunnerError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let saved_uid = self.ops.effective_uid();
        let saved_gid = self.ops.effective_gid();
        audit.elevation_requested(&request.resource, &request.user, request.uid, request.gid);

        // Group first: once the uid drops, setegid may no longer be allowed.
        if let Err(e) = self.ops.set_effective_gid(request.gid) {
            audit.elevation_failed(&request.resource, request.uid, request.gid, &e.to_string());
            return Err(PrivilegeError::Elevate {
                uid: request.uid,
                gid: request.gid,
                source: e,
            }
            .into());
        }
        if let Err(e) = self.ops.set_effective_uid(request.uid) {
            audit.elevation_failed(&request.resource, request.uid, request.gid, &e.to_string());
            if self.ops.set_effective_gid(saved_gid).is_err() {
                return self.abort_restore(&request.resource, audit);
            }
            return Err(PrivilegeError::Elevate {
                uid: request.uid,
                gid: request.gid,
                source: e,
            }
            .into());
        }
        audit.elevation_granted(&request.resource, request.uid, request.gid);

        let result = f();

        // Uid first: it is the one that regains the right to change gid.
        let uid_restored = self.ops.set_effective_uid(saved_uid).is_ok();
        let gid_restored = self.ops.set_effective_gid(saved_gid).is_ok();
        if !uid_restored || !gid_restored {
            return self.abort_restore(&request.resource, audit);
        }
        audit.elevation_restored(&request.resource);

        Ok(result)
    }

    /// Terminal path: emit the final audit record and abort. The error
    /// return is only reachable with a stubbed abort handler in tests.
    fn abort_restore<T>(&self, resource: &str, audit: &Audit) -> Result<T, RunnerError> {
        audit.restore_failed(resource);
        (self.abort)();
        Err(PrivilegeError::RestoreFailed.into())
    }
}

impl Default for PrivilegeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a `run_as_user` name to (uid, primary gid).
pub fn resolve_user(name: &str) -> Result<(u32, u32), RunnerError> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok((user.uid.as_raw(), user.gid.as_raw())),
        _ => Err(PrivilegeError::UnknownUser {
            user: name.to_string(),
        }
        .into()),
    }
}

/// Resolve a `run_as_group` name to a gid.
pub fn resolve_group(name: &str) -> Result<u32, RunnerError> {
    match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(PrivilegeError::UnknownGroup {
            group: name.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    /// Stubbed identity: tracks effective ids in atomics and can be told
    /// to fail specific transitions.
    struct StubIdentity {
        uid: AtomicU32,
        gid: AtomicU32,
        fail_set_uid_to: Option<u32>,
        fail_restore_uid: AtomicBool,
    }

    impl StubIdentity {
        fn new() -> Self {
            Self {
                uid: AtomicU32::new(0),
                gid: AtomicU32::new(0),
                fail_set_uid_to: None,
                fail_restore_uid: AtomicBool::new(false),
            }
        }
    }

    impl IdentityOps for Arc<StubIdentity> {
        fn effective_uid(&self) -> u32 {
            self.uid.load(Ordering::SeqCst)
        }

        fn effective_gid(&self) -> u32 {
            self.gid.load(Ordering::SeqCst)
        }

        fn set_effective_uid(&self, uid: u32) -> std::io::Result<()> {
            if self.fail_set_uid_to == Some(uid) {
                return Err(std::io::Error::other("stubbed seteuid failure"));
            }
            if self.fail_restore_uid.load(Ordering::SeqCst) && uid == 0 {
                return Err(std::io::Error::other("stubbed restore failure"));
            }
            self.uid.store(uid, Ordering::SeqCst);
            Ok(())
        }

        fn set_effective_gid(&self, gid: u32) -> std::io::Result<()> {
            self.gid.store(gid, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request() -> ElevationRequest {
        ElevationRequest {
            uid: 1042,
            gid: 1042,
            resource: "deploy.copy".to_string(),
            user: "appuser".to_string(),
        }
    }

    #[test]
    fn test_ids_restored_after_success() {
        let ids = Arc::new(StubIdentity::new());
        let manager = PrivilegeManager::with_ops(Box::new(ids.clone()), Box::new(|| {}));
        let audit = Audit::new("test-run");

        let seen = manager
            .with_privileges(&request(), &audit, || {
                (ids.effective_uid(), ids.effective_gid())
            })
            .unwrap();

        assert_eq!(seen, (1042, 1042));
        assert_eq!(ids.effective_uid(), 0);
        assert_eq!(ids.effective_gid(), 0);
    }

    #[test]
    fn test_closure_error_propagates_and_ids_restored() {
        let ids = Arc::new(StubIdentity::new());
        let manager = PrivilegeManager::with_ops(Box::new(ids.clone()), Box::new(|| {}));
        let audit = Audit::new("test-run");

        let result: Result<Result<(), String>, _> =
            manager.with_privileges(&request(), &audit, || Err("spawn failed".to_string()));

        assert_eq!(result.unwrap(), Err("spawn failed".to_string()));
        assert_eq!(ids.effective_uid(), 0);
        assert_eq!(ids.effective_gid(), 0);
    }

    #[test]
    fn test_elevation_failure_rolls_back_gid() {
        let mut stub = StubIdentity::new();
        stub.fail_set_uid_to = Some(1042);
        let ids = Arc::new(stub);
        let manager = PrivilegeManager::with_ops(Box::new(ids.clone()), Box::new(|| {}));
        let audit = Audit::new("test-run");

        let result = manager.with_privileges(&request(), &audit, || ());
        assert!(result.is_err());
        assert_eq!(ids.effective_uid(), 0);
        assert_eq!(ids.effective_gid(), 0);
    }

    #[test]
    fn test_restore_failure_invokes_abort() {
        let ids = Arc::new(StubIdentity::new());
        ids.fail_restore_uid.store(true, Ordering::SeqCst);
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_flag = aborted.clone();
        let manager = PrivilegeManager::with_ops(
            Box::new(ids.clone()),
            Box::new(move || aborted_flag.store(true, Ordering::SeqCst)),
        );
        let audit = Audit::new("test-run");

        let result = manager.with_privileges(&request(), &audit, || ());
        assert!(matches!(
            result,
            Err(RunnerError::Privilege(PrivilegeError::RestoreFailed))
        ));
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_elevations_are_mutually_exclusive() {
        let ids = Arc::new(StubIdentity::new());
        let manager = Arc::new(PrivilegeManager::with_ops(
            Box::new(ids.clone()),
            Box::new(|| {}),
        ));
        let audit = Audit::new("test-run");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let audit = audit.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(std::thread::spawn(move || {
                manager
                    .with_privileges(&request(), &audit, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
