//! Observed machine state.
//!
//! A snapshot is taken fresh at the start of every pass and never cached
//! across runs. The [`Inspector`] trait is the test seam: the planner is a
//! pure function over `(TargetState, ObservedState)`, so tests hand-build
//! snapshots instead of touching a machine.

use std::path::Path;

use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::firewall::{self, FirewallState};
use crate::target::{TargetState, REQUIRED_PACKAGES};

/// What currently exists on the machine, relative to one target.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    /// Required OS packages not yet installed.
    pub missing_packages: Vec<String>,
    /// Version string of the installed binary, `None` when absent.
    pub binary_version: Option<String>,
    /// Service user exists.
    pub user_exists: bool,
    /// Home directory exists.
    pub home_dir_exists: bool,
    /// Repository has been initialized (its config file exists).
    pub repo_initialized: bool,
    /// Swarm key file present.
    pub swarm_key_present: bool,
    /// Swarm key file mode bits, when present.
    pub swarm_key_mode: Option<u32>,
    /// Unit file present.
    pub unit_file_present: bool,
    /// Service reported active by the supervisor.
    pub service_active: bool,
    /// Service enabled for boot.
    pub service_enabled: bool,
    /// Virtual-host file present.
    pub vhost_present: bool,
    /// Activation symlink present.
    pub enabled_link_present: bool,
    /// Hashed credential store present.
    pub htpasswd_present: bool,
    /// TLS certificate present.
    pub tls_cert_present: bool,
    /// TLS private key present.
    pub tls_key_present: bool,
    /// TLS private key mode bits, when present.
    pub tls_key_mode: Option<u32>,
    /// Firewall posture.
    pub firewall: FirewallState,
}

impl ObservedState {
    /// Whether the installed binary matches the target version exactly.
    #[must_use]
    pub fn binary_at_version(&self, version: &str) -> bool {
        self.binary_version.as_deref() == Some(version)
    }
}

/// Source of [`ObservedState`] snapshots.
pub trait Inspector {
    /// Take a fresh snapshot for the given target.
    ///
    /// # Errors
    ///
    /// Returns an error only when the host cannot be inspected at all;
    /// individual absent artifacts are ordinary observations.
    fn observe(&self, target: &TargetState) -> Result<ObservedState, ReconcileError>;
}

/// Inspector backed by the real filesystem and external tools.
pub struct SystemInspector<'r, R: CommandRunner> {
    runner: &'r R,
}

impl<'r, R: CommandRunner> SystemInspector<'r, R> {
    pub const fn new(runner: &'r R) -> Self {
        Self { runner }
    }

    fn package_installed(&self, name: &str) -> bool {
        self.runner
            .run(&CommandSpec::new("dpkg").args(["-s", name]))
            .map(|out| out.success())
            .unwrap_or(false)
    }

    fn binary_version(&self, target: &TargetState) -> Option<String> {
        if !target.install_path.exists() {
            return None;
        }
        let out = self
            .runner
            .run(&CommandSpec::new(target.install_path.display().to_string()).arg("--version"))
            .ok()?;
        out.success().then(|| parse_kubo_version(&out.stdout))?
    }

    fn user_exists(&self, name: &str) -> bool {
        self.runner
            .run(&CommandSpec::new("getent").args(["passwd", name]))
            .map(|out| out.success())
            .unwrap_or(false)
    }

    fn unit_state(&self, unit: &str, verb: &str) -> bool {
        self.runner
            .run(&CommandSpec::new("systemctl").args([verb, unit]))
            .map(|out| out.success())
            .unwrap_or(false)
    }
}

impl<R: CommandRunner> Inspector for SystemInspector<'_, R> {
    fn observe(&self, target: &TargetState) -> Result<ObservedState, ReconcileError> {
        let missing_packages = REQUIRED_PACKAGES
            .iter()
            .filter(|p| !self.package_installed(p))
            .map(|p| (*p).to_string())
            .collect();

        Ok(ObservedState {
            missing_packages,
            binary_version: self.binary_version(target),
            user_exists: self.user_exists(&target.service_user),
            home_dir_exists: target.home_dir.is_dir(),
            repo_initialized: target.repo_dir.join("config").is_file(),
            swarm_key_present: target.swarm_key_path.is_file(),
            swarm_key_mode: file_mode(&target.swarm_key_path),
            unit_file_present: target.unit_path.is_file(),
            service_active: self.unit_state(&target.unit_name, "is-active"),
            service_enabled: self.unit_state(&target.unit_name, "is-enabled"),
            vhost_present: target.vhost_path.is_file(),
            enabled_link_present: target.enabled_link.exists(),
            htpasswd_present: target.htpasswd_path.is_file(),
            tls_cert_present: target.tls_cert.is_file(),
            tls_key_present: target.tls_key.is_file(),
            tls_key_mode: file_mode(&target.tls_key),
            firewall: firewall::observe(self.runner, target),
        })
    }
}

/// Permission bits of a file, `None` when it does not exist.
#[must_use]
pub fn file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        path.metadata().ok().map(|m| m.mode() & 0o777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

/// Extract the version from `ipfs --version` output
/// (`ipfs version 0.29.0`).
#[must_use]
pub fn parse_kubo_version(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .last()
        .filter(|v| v.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kubo_version_line() {
        assert_eq!(
            parse_kubo_version("ipfs version 0.29.0\n").as_deref(),
            Some("0.29.0")
        );
        assert_eq!(parse_kubo_version(""), None);
        assert_eq!(parse_kubo_version("ipfs version"), None);
    }

    #[test]
    fn binary_at_version_compares_exactly() {
        let observed = ObservedState {
            binary_version: Some("0.29.0".into()),
            ..Default::default()
        };
        assert!(observed.binary_at_version("0.29.0"));
        assert!(!observed.binary_at_version("0.30.0"));
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_reads_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.key");
        std::fs::write(&path, b"key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        assert_eq!(file_mode(&path), Some(0o600));
        assert_eq!(file_mode(&dir.path().join("absent")), None);
    }
}
