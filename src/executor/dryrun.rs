//! Dry-run analysis: the same gate as real execution, producing a
//! structured artifact instead of a spawn.
//!
//! Analyses accumulate per resource (group or command) into a single
//! `DryRunResult` that serializes to the stable JSON shape consumed by
//! tooling; a plain-text rendering exists for terminals. Detail levels
//! are strictly additive: `detailed` adds group inheritance analysis,
//! `full` adds the complete per-command environment with origins.
//!
//! Environment values whose names look sensitive are replaced by a
//! redaction marker unless the operator explicitly asks to see them.

use crate::config::plan::{RuntimeCommand, RuntimeGlobal, RuntimeGroup};
use crate::environment::EnvOrigin;
use crate::errors::RunnerError;
use crate::executor::spawn::TerminationReason;
use crate::risk::RiskAssessment;
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Marker substituted for sensitive values.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Variable names treated as sensitive. PASSWORD/SECRET/TOKEN/CREDENTIAL/
/// AUTH match anywhere; KEY must terminate a name segment so that e.g.
/// KEYWORDS stays visible.
static SENSITIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(PASSWORD|SECRET|TOKEN|CREDENTIAL|AUTH|[A-Z0-9]*KEY(_|$))")
        .expect("invalid sensitive-name regex")
});

/// How much detail the analysis carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Summary,
    Detailed,
    Full,
}

/// Output encoding for the analysis artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DryRunFormat {
    Text,
    Json,
}

/// True when a variable name should be redacted.
#[must_use]
pub fn is_sensitive_name(name: &str) -> bool {
    SENSITIVE_NAME.is_match(name)
}

// ---------------------------------------------------------------------------
// Serialized artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DryRunResult {
    pub metadata: Metadata,
    pub status: String,
    pub phase: String,
    pub summary: Summary,
    pub resource_analyses: Vec<ResourceAnalysis>,
    pub security_analysis: SecurityAnalysis,
    pub environment_info: EnvironmentInfo,
    pub file_verification: FileVerification,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub run_id: String,
    pub generated_at: String,
    pub detail_level: DetailLevel,
}

#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub groups_analyzed: usize,
    pub commands_analyzed: usize,
    pub commands_blocked: usize,
    pub commands_skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct ResourceAnalysis {
    #[serde(rename = "type")]
    pub kind: String,
    pub operation: String,
    pub target: String,
    pub status: String,
    pub parameters: serde_json::Value,
    pub impact: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
}

#[derive(Debug, Serialize)]
pub struct DebugInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inheritance_analysis: Option<InheritanceAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_environment: Option<FinalEnvironment>,
}

#[derive(Debug, Serialize)]
pub struct InheritanceAnalysis {
    pub mode: String,
    pub global_allowlist: Vec<String>,
    pub group_allowlist: Vec<String>,
    pub effective_allowlist: Vec<String>,
    pub global_env_import: Vec<String>,
    pub group_env_import: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FinalEnvironment {
    pub variables: IndexMap<String, EnvVariableAnalysis>,
}

#[derive(Debug, Serialize)]
pub struct EnvVariableAnalysis {
    pub value: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked: Option<bool>,
}

#[derive(Debug, Default, Serialize)]
pub struct SecurityAnalysis {
    pub findings: Vec<SecurityFinding>,
}

#[derive(Debug, Serialize)]
pub struct SecurityFinding {
    pub resource: String,
    pub level: String,
    pub description: String,
    pub pattern: String,
}

#[derive(Debug, Default, Serialize)]
pub struct EnvironmentInfo {
    pub global_allowlist: Vec<String>,
    pub global_env_import: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct FileVerification {
    pub verified: Vec<String>,
    pub failed: Vec<FailedVerification>,
}

#[derive(Debug, Serialize)]
pub struct FailedVerification {
    pub path: String,
    pub cause: String,
}

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

/// Accumulates analyses while the orchestrator walks the plan.
pub struct DryRunBuilder {
    detail: DetailLevel,
    show_sensitive: bool,
    run_id: String,
    resources: Vec<ResourceAnalysis>,
    summary: Summary,
    security: SecurityAnalysis,
    environment_info: EnvironmentInfo,
    file_verification: FileVerification,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl DryRunBuilder {
    #[must_use]
    pub fn new(detail: DetailLevel, show_sensitive: bool, run_id: &str) -> Self {
        Self {
            detail,
            show_sensitive,
            run_id: run_id.to_string(),
            resources: Vec::new(),
            summary: Summary::default(),
            security: SecurityAnalysis::default(),
            environment_info: EnvironmentInfo::default(),
            file_verification: FileVerification::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn global(&mut self, global: &RuntimeGlobal) {
        self.environment_info = EnvironmentInfo {
            global_allowlist: global.allowlist.clone(),
            global_env_import: global.env_import.clone(),
        };
    }

    /// Record a group about to be analyzed.
    pub fn group(&mut self, group: &RuntimeGroup, global: &RuntimeGlobal) {
        self.summary.groups_analyzed += 1;
        if group.priority.is_some() {
            self.warnings.push(format!(
                "group '{}' declares a priority, but groups always run in declared order",
                group.name
            ));
        }

        let debug_info = match self.detail {
            DetailLevel::Summary => None,
            DetailLevel::Detailed | DetailLevel::Full => Some(DebugInfo {
                inheritance_analysis: Some(InheritanceAnalysis {
                    mode: group.allowlist_mode.to_string(),
                    global_allowlist: global.allowlist.clone(),
                    group_allowlist: group.declared_allowlist.clone().unwrap_or_default(),
                    effective_allowlist: group.allowlist.clone(),
                    global_env_import: global.env_import.clone(),
                    group_env_import: group.env_import.clone(),
                }),
                final_environment: None,
            }),
        };

        self.resources.push(ResourceAnalysis {
            kind: "group".to_string(),
            operation: "analyze".to_string(),
            target: group.name.clone(),
            status: "ok".to_string(),
            parameters: serde_json::json!({
                "description": group.description,
                "workdir": group.workdir,
                "commands": group.commands.len(),
                "keep_temp_dirs": group.keep_temp_dirs,
            }),
            impact: format!("{} command(s) would run", group.commands.len()),
            timestamp: now(),
            debug_info,
        });
    }

    /// Record a command that passed the whole gate.
    pub fn command_ok(&mut self, rc: &RuntimeCommand, assessment: &RiskAssessment) {
        self.summary.commands_analyzed += 1;
        let impact = match &rc.run_as_user {
            Some(user) => format!("would execute as user '{user}'"),
            None => "would execute".to_string(),
        };
        self.push_command(rc, "ok", Some(assessment), impact);
    }

    /// Record a command the gate refused.
    pub fn command_blocked(
        &mut self,
        rc: &RuntimeCommand,
        reason: TerminationReason,
        error: &RunnerError,
    ) {
        self.summary.commands_analyzed += 1;
        self.summary.commands_blocked += 1;
        self.errors.push(error.to_string());
        if let Some(remediation) = error.remediation() {
            self.warnings.push(format!(
                "{}: remediation: {remediation}",
                rc.resource()
            ));
        }
        self.push_command(rc, &reason.to_string(), None, format!("blocked: {error}"));
    }

    /// Record a command never analyzed because its group halted.
    pub fn command_skipped(&mut self, rc: &RuntimeCommand) {
        self.summary.commands_skipped += 1;
        self.push_command(rc, "skipped", None, "skipped: group halted".to_string());
    }

    pub fn security_finding(&mut self, resource: &str, level: &str, description: &str, pattern: &str) {
        self.security.findings.push(SecurityFinding {
            resource: resource.to_string(),
            level: level.to_string(),
            description: description.to_string(),
            pattern: pattern.to_string(),
        });
    }

    pub fn file_verified(&mut self, path: &std::path::Path) {
        self.file_verification
            .verified
            .push(path.to_string_lossy().into_owned());
    }

    pub fn file_failed(&mut self, path: &std::path::Path, cause: &str) {
        self.file_verification.failed.push(FailedVerification {
            path: path.to_string_lossy().into_owned(),
            cause: cause.to_string(),
        });
    }

    fn push_command(
        &mut self,
        rc: &RuntimeCommand,
        status: &str,
        assessment: Option<&RiskAssessment>,
        impact: String,
    ) {
        let debug_info = match self.detail {
            DetailLevel::Full => Some(DebugInfo {
                inheritance_analysis: None,
                final_environment: Some(self.final_environment(rc)),
            }),
            _ => None,
        };

        self.resources.push(ResourceAnalysis {
            kind: "command".to_string(),
            operation: "execute".to_string(),
            target: rc.resource(),
            status: status.to_string(),
            parameters: serde_json::json!({
                "cmd": rc.resolved_cmd.clone().unwrap_or_else(|| std::path::PathBuf::from(&rc.cmd)),
                "args": rc.args,
                "timeout": rc.timeout,
                "workdir": rc.workdir,
                "output": rc.output,
                "output_size_limit": rc.output_size_limit,
                "run_as_user": rc.run_as_user,
                "run_as_group": rc.run_as_group,
                "max_risk_level": rc.max_risk_level.to_string(),
                "risk_level": assessment.map(|a| a.level.to_string()),
                "privileged": rc.privileged,
            }),
            impact,
            timestamp: now(),
            debug_info,
        });
    }

    /// The complete `(env, origin)` view for one command, redacted unless
    /// the operator opted out.
    fn final_environment(&self, rc: &RuntimeCommand) -> FinalEnvironment {
        let mut variables = IndexMap::with_capacity(rc.env.env.len());
        for (name, value) in &rc.env.env {
            let origin = rc
                .env
                .origins
                .get(name)
                .cloned()
                .unwrap_or(EnvOrigin::System);
            let masked = !self.show_sensitive && is_sensitive_name(name);
            variables.insert(
                name.clone(),
                EnvVariableAnalysis {
                    value: if masked {
                        REDACTION_MARKER.to_string()
                    } else {
                        value.clone()
                    },
                    source: origin.to_string(),
                    masked: masked.then_some(true),
                },
            );
        }
        FinalEnvironment { variables }
    }

    /// Seal the accumulated analyses into the final artifact.
    #[must_use]
    pub fn finish(self) -> DryRunResult {
        let issues = self.summary.commands_blocked + self.file_verification.failed.len();
        DryRunResult {
            metadata: Metadata {
                run_id: self.run_id,
                generated_at: now(),
                detail_level: self.detail,
            },
            status: if issues == 0 && self.errors.is_empty() {
                "ok".to_string()
            } else {
                "issues_found".to_string()
            },
            phase: "analysis".to_string(),
            summary: self.summary,
            resource_analyses: self.resources,
            security_analysis: self.security,
            environment_info: self.environment_info,
            file_verification: self.file_verification,
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Text rendering
// ---------------------------------------------------------------------------

/// Render the analysis for a terminal.
#[must_use]
pub fn render_text(result: &DryRunResult) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "dry-run analysis (run {})", result.metadata.run_id);
    let _ = writeln!(
        out,
        "status: {} | groups: {} | commands: {} | blocked: {} | skipped: {}",
        result.status,
        result.summary.groups_analyzed,
        result.summary.commands_analyzed,
        result.summary.commands_blocked,
        result.summary.commands_skipped,
    );

    for resource in &result.resource_analyses {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "[{}] {} ({})",
            resource.kind, resource.target, resource.status
        );
        let _ = writeln!(out, "  impact: {}", resource.impact);
        if let Some(debug) = &resource.debug_info {
            if let Some(inherit) = &debug.inheritance_analysis {
                let _ = writeln!(
                    out,
                    "  allowlist: {} (effective: {:?})",
                    inherit.mode, inherit.effective_allowlist
                );
            }
            if let Some(env) = &debug.final_environment {
                let _ = writeln!(out, "  environment:");
                for (name, var) in &env.variables {
                    let _ = writeln!(out, "    {}={} [{}]", name, var.value, var.source);
                }
            }
        }
    }

    if !result.file_verification.failed.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "verification failures:");
        for failure in &result.file_verification.failed {
            let _ = writeln!(out, "  {}: {}", failure.path, failure.cause);
        }
    }
    for warning in &result.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    for error in &result.errors {
        let _ = writeln!(out, "error: {error}");
    }
    out
}
