//! Risk classification of resolved commands.
//!
//! Every command is classified from its resolved binary path and argument
//! vector before anything is spawned. Rules are evaluated in a fixed order
//! and the first match wins. The `privileged` flag cancels exactly one
//! thing: the critical classification contributed by the escalation rule.
//! Residual risk from any other rule still gates against `max_risk_level`.

use crate::errors::{RunnerError, SecurityError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Discrete risk label, ordered so that policy comparison is `<=`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Binaries that switch or escalate user identity. Matching any of these
/// classifies the command critical; they are never run directly.
pub const ESCALATION_BINARIES: &[&str] = &["sudo", "su", "doas", "pkexec", "runuser"];

/// Binaries that destroy filesystems or partition tables outright.
const DESTRUCTIVE_BINARIES: &[&str] = &["fdisk", "sfdisk", "parted", "shred", "wipefs"];

/// Network download/transfer tools.
const NETWORK_BINARIES: &[&str] = &["wget", "curl", "nc", "netcat", "ncat"];

/// Symlink chains deeper than this classify the command high risk.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// One matched risk rule.
#[derive(Debug, Clone)]
pub struct RiskFinding {
    pub level: RiskLevel,
    /// Short human label, e.g. "Recursive file removal".
    pub description: &'static str,
    /// What matched (binary name or flag summary).
    pub pattern: String,
}

/// Outcome of classifying one command.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// The finding that produced `level`, absent for low risk.
    pub finding: Option<RiskFinding>,
    /// True when the classification came from the escalation rule.
    pub escalation: bool,
}

/// Classify a resolved command. `privileged` removes only the escalation
/// rule from consideration; it never lowers any other finding.
#[must_use]
pub fn evaluate(cmd: &Path, args: &[String], privileged: bool) -> RiskAssessment {
    let name = basename(cmd);

    if !privileged {
        if let Some(finding) = match_escalation(&name) {
            return RiskAssessment {
                level: finding.level,
                finding: Some(finding),
                escalation: true,
            };
        }
    }

    for rule in [
        match_destructive_fs,
        match_permissive,
        match_symlink_chain,
    ] {
        if let Some(finding) = rule(cmd, &name, args) {
            return RiskAssessment {
                level: finding.level,
                finding: Some(finding),
                escalation: false,
            };
        }
    }

    RiskAssessment {
        level: RiskLevel::Low,
        finding: None,
        escalation: false,
    }
}

/// Gate a command against its `max_risk_level` policy.
///
/// Escalation binaries are refused outright when `privileged` is unset,
/// regardless of how permissive `max_risk_level` is. Everything else is a
/// plain `actual <= allowed` comparison.
pub fn gate(
    resource: &str,
    cmd: &Path,
    args: &[String],
    max_risk_level: RiskLevel,
    privileged: bool,
) -> Result<RiskAssessment, RunnerError> {
    let name = basename(cmd);
    if let Some(finding) = match_escalation(&name) {
        if !privileged {
            return Err(SecurityError::EscalationCommand {
                resource: resource.to_string(),
                pattern: finding.pattern,
                remediation: "drop the escalation wrapper and set `run_as_user` on the command"
                    .to_string(),
            }
            .into());
        }
    }

    let assessment = evaluate(cmd, args, privileged);
    if assessment.level > max_risk_level {
        let description = assessment
            .finding
            .as_ref()
            .map(|f| f.description)
            .unwrap_or("unclassified");
        return Err(SecurityError::RiskExceeded {
            resource: resource.to_string(),
            actual: assessment.level.to_string(),
            allowed: max_risk_level.to_string(),
            description: description.to_string(),
            remediation: format!("add `max_risk_level = \"{}\"` to the command", assessment.level),
        }
        .into());
    }

    Ok(assessment)
}

fn basename(cmd: &Path) -> String {
    cmd.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn match_escalation(name: &str) -> Option<RiskFinding> {
    ESCALATION_BINARIES
        .iter()
        .find(|&&b| b == name)
        .map(|b| RiskFinding {
            level: RiskLevel::Critical,
            description: "Privilege escalation command",
            pattern: (*b).to_string(),
        })
}

fn match_destructive_fs(_cmd: &Path, name: &str, args: &[String]) -> Option<RiskFinding> {
    if name == "rm" && has_recursive_flag(args) && has_force_flag(args) {
        return Some(RiskFinding {
            level: RiskLevel::High,
            description: "Recursive file removal",
            pattern: "rm -rf".to_string(),
        });
    }
    if name == "dd" && args.iter().any(|a| a.starts_with("of=")) {
        return Some(RiskFinding {
            level: RiskLevel::High,
            description: "Raw overwrite via dd",
            pattern: "dd of=".to_string(),
        });
    }
    if name.starts_with("mkfs") {
        return Some(RiskFinding {
            level: RiskLevel::High,
            description: "Filesystem creation",
            pattern: name.to_string(),
        });
    }
    if DESTRUCTIVE_BINARIES.contains(&name) {
        return Some(RiskFinding {
            level: RiskLevel::High,
            description: "Destructive disk utility",
            pattern: name.to_string(),
        });
    }
    None
}

fn match_permissive(_cmd: &Path, name: &str, args: &[String]) -> Option<RiskFinding> {
    if name == "chmod" && args.iter().any(|a| a == "777" || a == "0777" || a == "a+rwx") {
        return Some(RiskFinding {
            level: RiskLevel::Medium,
            description: "World-writable permission change",
            pattern: "chmod 777".to_string(),
        });
    }
    if name == "chown"
        && args
            .iter()
            .any(|a| a == "root" || a.starts_with("root:") || a.starts_with("root."))
    {
        return Some(RiskFinding {
            level: RiskLevel::Medium,
            description: "Ownership change to root",
            pattern: "chown root".to_string(),
        });
    }
    if NETWORK_BINARIES.contains(&name) {
        return Some(RiskFinding {
            level: RiskLevel::Medium,
            description: "Network transfer tool",
            pattern: name.to_string(),
        });
    }
    None
}

fn match_symlink_chain(cmd: &Path, _name: &str, _args: &[String]) -> Option<RiskFinding> {
    let depth = symlink_chain_depth(cmd);
    if depth > MAX_SYMLINK_DEPTH {
        return Some(RiskFinding {
            level: RiskLevel::High,
            description: "Excessively deep symlink chain",
            pattern: format!("{depth} symlink levels"),
        });
    }
    None
}

/// Follow the symlink chain at `path`, counting levels. Stops counting one
/// past the cap; callers only care whether the cap was exceeded.
fn symlink_chain_depth(path: &Path) -> usize {
    let mut current: PathBuf = path.to_path_buf();
    let mut depth = 0usize;
    while depth <= MAX_SYMLINK_DEPTH {
        let meta = match std::fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(_) => break,
        };
        if !meta.file_type().is_symlink() {
            break;
        }
        depth += 1;
        match std::fs::read_link(&current) {
            Ok(target) if target.is_absolute() => current = target,
            Ok(target) => {
                current = current
                    .parent()
                    .unwrap_or(Path::new("/"))
                    .join(target);
            }
            Err(_) => break,
        }
    }
    depth
}

fn has_recursive_flag(args: &[String]) -> bool {
    args.iter().any(|a| {
        a == "-r"
            || a == "-R"
            || a == "--recursive"
            || (a.starts_with('-')
                && !a.starts_with("--")
                && (a.contains('r') || a.contains('R')))
    })
}

fn has_force_flag(args: &[String]) -> bool {
    args.iter().any(|a| {
        a == "-f"
            || a == "--force"
            || (a.starts_with('-') && !a.starts_with("--") && a.contains('f'))
    })
}
