//! Service supervisor integration.
//!
//! Renders the relay's systemd unit from the target and wraps the
//! `systemctl`/`journalctl` invocations the executors need. The unit file
//! is rewritten unconditionally every convergence pass; it is pure
//! regeneration from [`TargetState`], so overwrite cannot lose anything.

use std::path::Path;

use tracing::debug;

use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::target::TargetState;

/// Unit template. `%placeholders%` are substituted at render time.
const UNIT_TEMPLATE: &str = "\
[Unit]\n\
Description=IPFS relay daemon\n\
After=network-online.target\n\
Wants=network-online.target\n\
\n\
[Service]\n\
Type=simple\n\
User=%user%\n\
Group=%user%\n\
Environment=IPFS_PATH=%repo%\n\
ExecStart=%binary% daemon --migrate --enable-gc\n\
Restart=on-failure\n\
RestartSec=10\n\
LimitNOFILE=65536\n\
\n\
[Install]\n\
WantedBy=multi-user.target\n\
";

/// Render the unit file content for a target.
#[must_use]
pub fn render_unit(target: &TargetState) -> String {
    UNIT_TEMPLATE
        .replace("%user%", &target.service_user)
        .replace("%repo%", &target.repo_dir.display().to_string())
        .replace("%binary%", &target.install_path.display().to_string())
}

/// Write the unit file (mode 0644).
///
/// # Errors
///
/// Returns an I/O error when the file cannot be written.
pub fn write_unit(target: &TargetState) -> Result<(), ReconcileError> {
    write_world_readable(&target.unit_path, render_unit(target).as_bytes())
}

/// `systemctl daemon-reload`.
///
/// # Errors
///
/// Returns the command failure.
pub fn daemon_reload<R: CommandRunner>(runner: &R) -> Result<(), ReconcileError> {
    runner.run_checked(&CommandSpec::new("systemctl").arg("daemon-reload"))?;
    Ok(())
}

/// `systemctl enable <unit>`.
///
/// # Errors
///
/// Returns the command failure.
pub fn enable<R: CommandRunner>(runner: &R, unit: &str) -> Result<(), ReconcileError> {
    runner.run_checked(&CommandSpec::new("systemctl").args(["enable", unit]))?;
    Ok(())
}

/// `systemctl restart <unit>`.
///
/// # Errors
///
/// Returns the command failure.
pub fn restart<R: CommandRunner>(runner: &R, unit: &str) -> Result<(), ReconcileError> {
    debug!(unit, "restarting service");
    runner.run_checked(&CommandSpec::new("systemctl").args(["restart", unit]))?;
    Ok(())
}

/// `systemctl stop <unit>`.
///
/// # Errors
///
/// Returns the command failure.
pub fn stop<R: CommandRunner>(runner: &R, unit: &str) -> Result<(), ReconcileError> {
    runner.run_checked(&CommandSpec::new("systemctl").args(["stop", unit]))?;
    Ok(())
}

/// `systemctl disable <unit>`.
///
/// # Errors
///
/// Returns the command failure.
pub fn disable<R: CommandRunner>(runner: &R, unit: &str) -> Result<(), ReconcileError> {
    runner.run_checked(&CommandSpec::new("systemctl").args(["disable", unit]))?;
    Ok(())
}

/// `systemctl reload-or-restart <unit>` — used for the shared proxy,
/// which other sites may be using.
///
/// # Errors
///
/// Returns the command failure.
pub fn reload_or_restart<R: CommandRunner>(runner: &R, unit: &str) -> Result<(), ReconcileError> {
    runner.run_checked(&CommandSpec::new("systemctl").args(["reload-or-restart", unit]))?;
    Ok(())
}

/// Recent journal lines for a unit, `None` when `journalctl` is absent
/// or unreadable.
#[must_use]
pub fn journal_tail<R: CommandRunner>(runner: &R, unit: &str, lines: u32) -> Option<String> {
    if !runner.available("journalctl") {
        return None;
    }
    runner
        .run(
            &CommandSpec::new("journalctl")
                .args(["-u", unit, "-n", &lines.to_string(), "--no-pager"]),
        )
        .ok()
        .filter(|out| out.success())
        .map(|out| out.stdout)
}

pub(crate) fn write_world_readable(path: &Path, bytes: &[u8]) -> Result<(), ReconcileError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::config::RelayConfig;
    use crate::gate::DistArch;
    use crate::target::InstallOverrides;

    fn target() -> TargetState {
        TargetState::resolve(
            &RelayConfig::default(),
            InstallOverrides::default(),
            DistArch::Amd64,
            Ipv4Addr::new(192, 0, 2, 10),
        )
    }

    #[test]
    fn unit_renders_without_placeholder_residue() {
        let unit = render_unit(&target());
        assert!(!unit.contains('%'));
        assert!(unit.contains("User=ipfs"));
        assert!(unit.contains("Environment=IPFS_PATH=/var/lib/ipfs/.ipfs"));
        assert!(unit.contains("ExecStart=/usr/local/bin/ipfs daemon"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn unit_rendering_is_deterministic() {
        let target = target();
        assert_eq!(render_unit(&target), render_unit(&target));
    }
}
