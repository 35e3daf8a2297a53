//! Firewall rule management.
//!
//! Prefers `ufw` when installed, falls back to raw `iptables`. Rule checks
//! use the tools' own idempotent forms (`iptables -C`, `ufw status`) so a
//! converged host plans no firewall work.

use tracing::debug;

use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::target::TargetState;

/// Which firewall CLI manages rules on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallBackend {
    /// Uncomplicated Firewall front-end.
    Ufw,
    /// Raw iptables.
    Iptables,
}

impl FirewallBackend {
    /// Program name of the backend CLI.
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::Ufw => "ufw",
            Self::Iptables => "iptables",
        }
    }
}

/// Observed firewall posture for the relay's two public ports.
#[derive(Debug, Clone, Default)]
pub struct FirewallState {
    /// Backend found on the host, when any.
    pub backend: Option<FirewallBackend>,
    /// HTTPS port rule present. `None` when no backend is available.
    pub https_open: Option<bool>,
    /// Swarm port rule present. `None` when no backend is available.
    pub swarm_open: Option<bool>,
}

/// Pick the firewall backend installed on this host.
#[must_use]
pub fn detect_backend<R: CommandRunner>(runner: &R) -> Option<FirewallBackend> {
    if runner.available("ufw") {
        Some(FirewallBackend::Ufw)
    } else if runner.available("iptables") {
        Some(FirewallBackend::Iptables)
    } else {
        None
    }
}

/// Snapshot rule presence for the target's public ports.
///
/// Degrades to `None` fields rather than failing when no firewall CLI is
/// installed; convergence decides whether that is fatal.
#[must_use]
pub fn observe<R: CommandRunner>(runner: &R, target: &TargetState) -> FirewallState {
    let Some(backend) = detect_backend(runner) else {
        return FirewallState::default();
    };

    FirewallState {
        backend: Some(backend),
        https_open: rule_present(runner, backend, target.https_port),
        swarm_open: rule_present(runner, backend, target.swarm_port),
    }
}

fn rule_present<R: CommandRunner>(
    runner: &R,
    backend: FirewallBackend,
    port: u16,
) -> Option<bool> {
    match backend {
        FirewallBackend::Ufw => {
            let out = runner.run(&CommandSpec::new("ufw").arg("status")).ok()?;
            Some(out.stdout.contains(&format!("{port}/tcp")))
        },
        FirewallBackend::Iptables => {
            // `-C` exits 0 iff the exact rule exists.
            let out = runner
                .run(&CommandSpec::new("iptables").args([
                    "-C",
                    "INPUT",
                    "-p",
                    "tcp",
                    "--dport",
                    &port.to_string(),
                    "-j",
                    "ACCEPT",
                ]))
                .ok()?;
            Some(out.success())
        },
    }
}

/// Open a TCP port.
///
/// # Errors
///
/// Returns `DependencyMissing` when no firewall CLI exists, or the command
/// failure otherwise.
pub fn allow_port<R: CommandRunner>(runner: &R, port: u16) -> Result<(), ReconcileError> {
    let backend = detect_backend(runner).ok_or(ReconcileError::DependencyMissing {
        tool: "ufw or iptables".to_string(),
    })?;
    debug!(port, backend = backend.program(), "opening firewall port");

    match backend {
        FirewallBackend::Ufw => {
            runner.run_checked(&CommandSpec::new("ufw").args(["allow", &format!("{port}/tcp")]))?;
        },
        FirewallBackend::Iptables => {
            if rule_present(runner, backend, port) != Some(true) {
                runner.run_checked(&CommandSpec::new("iptables").args([
                    "-A",
                    "INPUT",
                    "-p",
                    "tcp",
                    "--dport",
                    &port.to_string(),
                    "-j",
                    "ACCEPT",
                ]))?;
            }
        },
    }
    Ok(())
}

/// Remove a TCP port rule. Best-effort caller semantics: an absent rule or
/// absent backend surfaces as an error for the caller to aggregate.
///
/// # Errors
///
/// Returns `DependencyMissing` when no firewall CLI exists, or the command
/// failure otherwise.
pub fn remove_port<R: CommandRunner>(runner: &R, port: u16) -> Result<(), ReconcileError> {
    let backend = detect_backend(runner).ok_or(ReconcileError::DependencyMissing {
        tool: "ufw or iptables".to_string(),
    })?;

    match backend {
        FirewallBackend::Ufw => {
            runner.run_checked(&CommandSpec::new("ufw").args(["delete", "allow", &format!("{port}/tcp")]))?;
        },
        FirewallBackend::Iptables => {
            runner.run_checked(&CommandSpec::new("iptables").args([
                "-D",
                "INPUT",
                "-p",
                "tcp",
                "--dport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ]))?;
        },
    }
    Ok(())
}

/// Raw rule listing for the diagnostic report, `None` when unavailable.
#[must_use]
pub fn listing<R: CommandRunner>(runner: &R) -> Option<String> {
    let backend = detect_backend(runner)?;
    let spec = match backend {
        FirewallBackend::Ufw => CommandSpec::new("ufw").args(["status", "verbose"]),
        FirewallBackend::Iptables => CommandSpec::new("iptables").args(["-L", "INPUT", "-n"]),
    };
    runner.run(&spec).ok().map(|out| out.stdout)
}
