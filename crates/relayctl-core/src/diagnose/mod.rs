//! Read-only diagnostic probe.
//!
//! Gathers the observed snapshot plus runtime signals (peer connectivity,
//! journal excerpt, firewall rules, key permissions, certificate expiry)
//! into a structured report. Never mutates the machine. A missing optional
//! tool degrades that check to `Unavailable` instead of failing the probe.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::firewall;
use crate::observe::{Inspector, ObservedState};
use crate::service;
use crate::target::TargetState;

const JOURNAL_LINES: u32 = 25;

/// Severity of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// As expected.
    Ok,
    /// Working but degraded or risky.
    Warn,
    /// Broken.
    Error,
    /// The probe tool for this check is not installed.
    Unavailable,
}

/// One diagnostic finding.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    /// Stable check name.
    pub name: String,
    /// Severity.
    pub status: CheckStatus,
    /// One-line summary.
    pub message: String,
    /// Raw tool output, populated in verbose mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

/// Full diagnostic report.
#[derive(Debug, Serialize)]
pub struct DiagnoseReport {
    /// When the probe ran.
    pub generated_at: DateTime<Utc>,
    /// Advertised server name of the probed target.
    pub server_name: String,
    /// Individual findings.
    pub checks: Vec<Check>,
}

impl DiagnoseReport {
    /// Worst severity across all checks (`Unavailable` does not count).
    #[must_use]
    pub fn worst(&self) -> CheckStatus {
        let mut worst = CheckStatus::Ok;
        for check in &self.checks {
            match check.status {
                CheckStatus::Error => return CheckStatus::Error,
                CheckStatus::Warn => worst = CheckStatus::Warn,
                CheckStatus::Ok | CheckStatus::Unavailable => {},
            }
        }
        worst
    }
}

/// Run the probe.
///
/// # Errors
///
/// Returns an error only when the host cannot be inspected at all.
pub fn run<I: Inspector, R: CommandRunner>(
    inspector: &I,
    runner: &R,
    target: &TargetState,
    verbose: bool,
) -> Result<DiagnoseReport, ReconcileError> {
    let observed = inspector.observe(target)?;
    let mut checks = Vec::new();

    checks.push(binary_check(target, &observed));
    checks.push(match (observed.service_active, observed.service_enabled) {
        (true, true) => Check::new("service", CheckStatus::Ok, "active and enabled"),
        (true, false) => Check::new(
            "service",
            CheckStatus::Warn,
            "active but not enabled for boot",
        ),
        (false, _) => Check::new("service", CheckStatus::Error, "not active"),
    });

    checks.push(if observed.repo_initialized {
        Check::new("repository", CheckStatus::Ok, format!("initialized at {}", target.repo_dir.display()))
    } else {
        Check::new("repository", CheckStatus::Error, "not initialized")
    });

    checks.push(swarm_key_check(&observed));
    checks.push(if observed.htpasswd_present {
        Check::new("credentials", CheckStatus::Ok, "hashed credential store present")
    } else {
        Check::new("credentials", CheckStatus::Error, "credential store missing")
    });

    checks.push(tls_check(runner, target, &observed, verbose));
    checks.push(vhost_check(&observed));
    checks.push(firewall_check(runner, &observed, verbose));
    checks.push(peers_check(runner, target, &observed));
    checks.push(journal_check(runner, target, verbose));

    Ok(DiagnoseReport {
        generated_at: Utc::now(),
        server_name: target.server_name.clone(),
        checks,
    })
}

fn binary_check(target: &TargetState, observed: &ObservedState) -> Check {
    match &observed.binary_version {
        Some(version) if *version == target.kubo_version => Check::new(
            "binary",
            CheckStatus::Ok,
            format!("kubo v{version} at {}", target.install_path.display()),
        ),
        Some(version) => Check::new(
            "binary",
            CheckStatus::Warn,
            format!("installed v{version}, target v{}", target.kubo_version),
        ),
        None => Check::new("binary", CheckStatus::Error, "not installed"),
    }
}

fn swarm_key_check(observed: &ObservedState) -> Check {
    if !observed.swarm_key_present {
        return Check::new(
            "swarm-key",
            CheckStatus::Warn,
            "no private-network key; node will join the public network",
        );
    }
    match observed.swarm_key_mode {
        Some(0o600) => Check::new("swarm-key", CheckStatus::Ok, "present, owner-only"),
        Some(mode) => Check::new(
            "swarm-key",
            CheckStatus::Warn,
            format!("present but mode {mode:o}; expected 600"),
        ),
        None => Check::new("swarm-key", CheckStatus::Ok, "present"),
    }
}

fn tls_check<R: CommandRunner>(
    runner: &R,
    target: &TargetState,
    observed: &ObservedState,
    verbose: bool,
) -> Check {
    if !(observed.tls_cert_present && observed.tls_key_present) {
        return Check::new("tls", CheckStatus::Error, "certificate pair missing");
    }
    if observed.tls_key_mode.is_some_and(|m| m != 0o600) {
        return Check::new(
            "tls",
            CheckStatus::Warn,
            format!(
                "private key mode {:o}; expected 600",
                observed.tls_key_mode.unwrap_or(0)
            ),
        );
    }
    if !runner.available("openssl") {
        return Check::new("tls", CheckStatus::Unavailable, "openssl not installed");
    }

    let out = runner.run(
        &CommandSpec::new("openssl")
            .args(["x509", "-noout", "-enddate", "-in"])
            .arg(target.tls_cert.display().to_string()),
    );
    match out {
        Ok(out) if out.success() => {
            let enddate = out.stdout.trim().trim_start_matches("notAfter=").to_string();
            Check::new("tls", CheckStatus::Ok, format!("certificate valid until {enddate}"))
                .with_detail(verbose.then(|| out.stdout.clone()))
        },
        _ => Check::new(
            "tls",
            CheckStatus::Warn,
            "certificate present but could not be parsed",
        ),
    }
}

fn vhost_check(observed: &ObservedState) -> Check {
    match (observed.vhost_present, observed.enabled_link_present) {
        (true, true) => Check::new("vhost", CheckStatus::Ok, "present and enabled"),
        (true, false) => Check::new("vhost", CheckStatus::Warn, "present but not enabled"),
        (false, _) => Check::new("vhost", CheckStatus::Error, "virtual host missing"),
    }
}

fn firewall_check<R: CommandRunner>(
    runner: &R,
    observed: &ObservedState,
    verbose: bool,
) -> Check {
    let Some(backend) = observed.firewall.backend else {
        return Check::new("firewall", CheckStatus::Unavailable, "no firewall CLI installed");
    };
    let detail = verbose.then(|| firewall::listing(runner)).flatten();
    match (observed.firewall.https_open, observed.firewall.swarm_open) {
        (Some(true), Some(true)) => Check::new(
            "firewall",
            CheckStatus::Ok,
            format!("relay ports open ({})", backend.program()),
        )
        .with_detail(detail),
        _ => Check::new("firewall", CheckStatus::Warn, "relay ports not fully open")
            .with_detail(detail),
    }
}

fn peers_check<R: CommandRunner>(runner: &R, target: &TargetState, observed: &ObservedState) -> Check {
    if observed.binary_version.is_none() || !observed.service_active {
        return Check::new("peers", CheckStatus::Unavailable, "node not running");
    }

    let out = runner.run(
        &CommandSpec::new(target.install_path.display().to_string())
            .args(["swarm", "peers"])
            .env("IPFS_PATH", target.repo_dir.display().to_string())
            .run_as(target.service_user.clone()),
    );
    match out {
        Ok(out) if out.success() => {
            let count = out.stdout.lines().filter(|l| !l.trim().is_empty()).count();
            if count == 0 {
                Check::new("peers", CheckStatus::Warn, "connected to 0 peers")
            } else {
                Check::new("peers", CheckStatus::Ok, format!("connected to {count} peers"))
            }
        },
        _ => Check::new("peers", CheckStatus::Warn, "could not query the node API"),
    }
}

fn journal_check<R: CommandRunner>(runner: &R, target: &TargetState, verbose: bool) -> Check {
    match service::journal_tail(runner, &target.unit_name, JOURNAL_LINES) {
        Some(tail) => {
            let errors = tail
                .lines()
                .filter(|l| l.contains("error") || l.contains("ERROR"))
                .count();
            let status = if errors == 0 { CheckStatus::Ok } else { CheckStatus::Warn };
            Check::new(
                "journal",
                status,
                format!("{errors} error lines in last {JOURNAL_LINES} entries"),
            )
            .with_detail(verbose.then_some(tail))
        },
        None => Check::new("journal", CheckStatus::Unavailable, "journalctl not installed"),
    }
}

/// Render the report for a terminal, severity-colored.
#[must_use]
pub fn render_human(report: &DiagnoseReport) -> String {
    let mut out = format!(
        "relay diagnostics for {} ({})\n",
        report.server_name,
        report.generated_at.format("%Y-%m-%d %H:%M:%SZ")
    );
    for check in &report.checks {
        let (tag, color) = match check.status {
            CheckStatus::Ok => ("ok", "\x1b[32m"),
            CheckStatus::Warn => ("warn", "\x1b[33m"),
            CheckStatus::Error => ("error", "\x1b[31m"),
            CheckStatus::Unavailable => ("n/a", "\x1b[2m"),
        };
        out.push_str(&format!(
            "  {color}{tag:>5}\x1b[0m  {:<12} {}\n",
            check.name, check.message
        ));
        if let Some(detail) = &check.detail {
            for line in detail.lines() {
                out.push_str(&format!("            {line}\n"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: CheckStatus) -> Check {
        Check::new("x", status, "msg")
    }

    #[test]
    fn worst_ignores_unavailable() {
        let report = DiagnoseReport {
            generated_at: Utc::now(),
            server_name: "192.0.2.10".into(),
            checks: vec![check(CheckStatus::Ok), check(CheckStatus::Unavailable)],
        };
        assert_eq!(report.worst(), CheckStatus::Ok);
    }

    #[test]
    fn worst_prefers_error_over_warn() {
        let report = DiagnoseReport {
            generated_at: Utc::now(),
            server_name: "192.0.2.10".into(),
            checks: vec![
                check(CheckStatus::Warn),
                check(CheckStatus::Error),
                check(CheckStatus::Ok),
            ],
        };
        assert_eq!(report.worst(), CheckStatus::Error);
    }

    #[test]
    fn json_serialization_skips_empty_detail() {
        let report = DiagnoseReport {
            generated_at: Utc::now(),
            server_name: "192.0.2.10".into(),
            checks: vec![check(CheckStatus::Ok)],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn human_rendering_colors_by_severity() {
        let report = DiagnoseReport {
            generated_at: Utc::now(),
            server_name: "192.0.2.10".into(),
            checks: vec![check(CheckStatus::Error)],
        };
        let text = render_human(&report);
        assert!(text.contains("\x1b[31m"));
        assert!(text.contains("192.0.2.10"));
    }
}
