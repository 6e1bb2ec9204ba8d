//! Audit record emission.
//!
//! Every security-relevant transition produces one flat key-value record
//! through `tracing` with target `audit`, so sinks can route them apart
//! from diagnostic logging. Each record carries its own `ts` field so the
//! timestamp survives sinks that drop the subscriber's formatting.
//! Records never contain environment values or any other sensitive
//! material, only names and outcomes.

/// RFC 3339 timestamp for one record.
fn ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone)]
pub struct Audit {
    run_id: String,
}

impl Audit {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn command_start(&self, resource: &str, cmd: &str) {
        tracing::info!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "command_start",
            resource = %resource,
            cmd = %cmd,
        );
    }

    pub fn command_end(&self, resource: &str, exit_code: i32, duration_ms: u128, reason: &str) {
        tracing::info!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "command_end",
            resource = %resource,
            exit_code,
            duration_ms,
            reason = %reason,
        );
    }

    pub fn verification_failed(&self, path: &std::path::Path, cause: &str) {
        tracing::warn!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "verification_failed",
            path = %path.display(),
            cause = %cause,
        );
    }

    pub fn risk_blocked(&self, resource: &str, level: &str, pattern: &str) {
        tracing::warn!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "risk_blocked",
            resource = %resource,
            level = %level,
            pattern = %pattern,
        );
    }

    pub fn elevation_requested(&self, resource: &str, target_user: &str, uid: u32, gid: u32) {
        tracing::info!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "elevation_requested",
            resource = %resource,
            target_user = %target_user,
            uid,
            gid,
        );
    }

    pub fn elevation_granted(&self, resource: &str, uid: u32, gid: u32) {
        tracing::info!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "elevation_granted",
            resource = %resource,
            uid,
            gid,
        );
    }

    pub fn elevation_failed(&self, resource: &str, uid: u32, gid: u32, error: &str) {
        tracing::warn!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "elevation_failed",
            resource = %resource,
            uid,
            gid,
            error = %error,
        );
    }

    pub fn elevation_restored(&self, resource: &str) {
        tracing::info!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "elevation_restored",
            resource = %resource,
        );
    }

    pub fn restore_failed(&self, resource: &str) {
        tracing::error!(
            target: "audit",
            ts = %ts(),
            run_id = %self.run_id,
            event = "restore_failed",
            resource = %resource,
        );
    }
}
