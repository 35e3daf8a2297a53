//! Divergence executor.
//!
//! The mirror image of `apply`: every step is best-effort, an
//! already-absent target is ordinary success, and the pass never aborts
//! partway. What could not be removed is aggregated into the final
//! [`TeardownReport`] instead of stopping the run.

use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{ReconcileError, Residue};
use crate::exec::{CommandRunner, CommandSpec};
use crate::firewall;
use crate::plan::{TeardownPlan, TeardownStep};
use crate::proxy;
use crate::service;
use crate::target::TargetState;

/// Narrow residue sweep for the comprehensive removal scope.
///
/// Patterns are anchored to exact file names and exact whitespace-separated
/// tokens, never bare substrings: the sweep is allowed to delete files it
/// did not create, so the scope set has to be tight enough that an
/// unrelated file merely containing "ipfs" in its name can never match.
#[derive(Debug, Clone)]
pub struct SweepSpec {
    /// Directories that may hold leftover unit files.
    pub unit_dirs: Vec<std::path::PathBuf>,
    /// Exact unit file names to delete from those directories.
    pub unit_names: Vec<String>,
    /// Exact paths of binary symlinks/copies to delete.
    pub binary_links: Vec<std::path::PathBuf>,
    /// User whose crontab is cleared.
    pub crontab_user: String,
    /// Hosts file to filter.
    pub hosts_file: std::path::PathBuf,
    /// Exact hostname token whose lines are dropped from the hosts file.
    pub hosts_token: String,
    /// Shell profile files to filter.
    pub profile_files: Vec<std::path::PathBuf>,
    /// Lines containing this marker are dropped from profile files.
    pub profile_marker: String,
}

impl SweepSpec {
    /// Residue locations for a target, at their well-known system paths.
    #[must_use]
    pub fn for_target(target: &TargetState) -> Self {
        Self {
            unit_dirs: vec![
                "/etc/systemd/system".into(),
                "/lib/systemd/system".into(),
                "/usr/lib/systemd/system".into(),
            ],
            unit_names: vec![
                target.unit_name.clone(),
                "ipfs.service".to_string(),
                "ipfs-daemon.service".to_string(),
            ],
            binary_links: vec![
                "/usr/local/bin/ipfs".into(),
                "/usr/bin/ipfs".into(),
                "/usr/local/bin/ipfs-update".into(),
            ],
            crontab_user: target.service_user.clone(),
            hosts_file: "/etc/hosts".into(),
            hosts_token: "ipfs-relay".to_string(),
            profile_files: vec![
                "/root/.bashrc".into(),
                "/root/.profile".into(),
                target.home_dir.join(".bashrc"),
            ],
            profile_marker: "IPFS_PATH=".to_string(),
        }
    }
}

/// Aggregate outcome of a divergence pass.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Steps that completed (including "already absent").
    pub removed: Vec<String>,
    /// Steps that could not complete.
    pub residue: Vec<Residue>,
}

impl TeardownReport {
    /// Whether every step completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.residue.is_empty()
    }
}

/// Execute a teardown plan, best-effort throughout.
pub fn run_teardown<R: CommandRunner>(runner: &R, plan: &TeardownPlan) -> TeardownReport {
    let mut report = TeardownReport::default();

    for step in &plan.steps {
        info!(%step, "removing");
        match run_step(runner, step) {
            Ok(()) => report.removed.push(step.to_string()),
            Err(err) => {
                warn!(%step, error = %err, "teardown step failed; continuing");
                report.residue.push(Residue::new(step.to_string(), err.to_string()));
            },
        }
    }

    if let Some(sweep) = &plan.sweep {
        run_sweep(runner, sweep, &mut report);
    }

    report
}

fn run_step<R: CommandRunner>(runner: &R, step: &TeardownStep) -> Result<(), ReconcileError> {
    match step {
        TeardownStep::StopService { unit } => {
            if unit_reports(runner, unit, "is-active") {
                service::stop(runner, unit)?;
            }
            Ok(())
        },
        TeardownStep::DisableService { unit } => {
            if unit_reports(runner, unit, "is-enabled") {
                service::disable(runner, unit)?;
            }
            Ok(())
        },
        TeardownStep::KillStray { binary } => kill_stray(runner, binary),
        TeardownStep::RemoveFile { path } => remove_file_if_present(path),
        TeardownStep::RemoveDir { path } => {
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            }
            Ok(())
        },
        TeardownStep::RemoveUser { name } => {
            let exists = runner
                .run(&CommandSpec::new("getent").args(["passwd", name.as_str()]))
                .map(|out| out.success())
                .unwrap_or(false);
            if exists {
                runner.run_checked(&CommandSpec::new("userdel").arg(name))?;
            }
            Ok(())
        },
        TeardownStep::CloseFirewallPort { port } => {
            // No firewall CLI means no rule to close.
            if firewall::detect_backend(runner).is_some() {
                firewall::remove_port(runner, *port)?;
            }
            Ok(())
        },
        TeardownStep::DaemonReload => service::daemon_reload(runner),
        TeardownStep::ReloadProxy => service::reload_or_restart(runner, proxy::PROXY_UNIT),
    }
}

fn unit_reports<R: CommandRunner>(runner: &R, unit: &str, verb: &str) -> bool {
    runner
        .run(&CommandSpec::new("systemctl").args([verb, unit]))
        .map(|out| out.success())
        .unwrap_or(false)
}

/// SIGTERM any process still executing the installed binary. Matching is
/// anchored to the exact binary path; an absent `pgrep` or an empty match
/// set is success.
fn kill_stray<R: CommandRunner>(runner: &R, binary: &Path) -> Result<(), ReconcileError> {
    if !runner.available("pgrep") {
        return Ok(());
    }
    let pattern = format!("^{}( |$)", binary.display());
    let out = runner.run(&CommandSpec::new("pgrep").args(["-f", &pattern]))?;
    if !out.success() {
        return Ok(());
    }

    for line in out.stdout.lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {},
                Err(errno) => {
                    return Err(ReconcileError::Io(std::io::Error::from_raw_os_error(
                        errno as i32,
                    )));
                },
            }
        }
    }
    Ok(())
}

fn remove_file_if_present(path: &Path) -> Result<(), ReconcileError> {
    // symlink_metadata so dangling activation links still get removed
    if path.symlink_metadata().is_ok() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn run_sweep<R: CommandRunner>(runner: &R, sweep: &SweepSpec, report: &mut TeardownReport) {
    for dir in &sweep.unit_dirs {
        for name in &sweep.unit_names {
            let path = dir.join(name);
            record(report, format!("sweep unit {}", path.display()), {
                remove_file_if_present(&path)
            });
        }
    }

    for path in &sweep.binary_links {
        record(report, format!("sweep binary {}", path.display()), {
            remove_file_if_present(path)
        });
    }

    if runner.available("crontab") {
        let out = runner.run(
            &CommandSpec::new("crontab").args(["-u", &sweep.crontab_user, "-r"]),
        );
        match out {
            // "no crontab for <user>" is the expected, already-clean case
            Ok(out) if !out.success() && !out.stderr.contains("no crontab") => {
                report.residue.push(Residue::new(
                    format!("sweep crontab for {}", sweep.crontab_user),
                    out.stderr.trim().to_string(),
                ));
            },
            Ok(_) => report
                .removed
                .push(format!("sweep crontab for {}", sweep.crontab_user)),
            Err(err) => report.residue.push(Residue::new(
                format!("sweep crontab for {}", sweep.crontab_user),
                err.to_string(),
            )),
        }
    }

    record(
        report,
        format!("sweep hosts entries in {}", sweep.hosts_file.display()),
        filter_lines(&sweep.hosts_file, |line| {
            !line.split_whitespace().any(|token| token == sweep.hosts_token)
        }),
    );

    for path in &sweep.profile_files {
        record(
            report,
            format!("sweep profile lines in {}", path.display()),
            filter_lines(path, |line| !line.contains(&sweep.profile_marker)),
        );
    }
}

fn record(report: &mut TeardownReport, step: String, result: Result<(), ReconcileError>) {
    match result {
        Ok(()) => report.removed.push(step),
        Err(err) => report.residue.push(Residue::new(step, err.to_string())),
    }
}

/// Rewrite a line-oriented file keeping only lines matching `keep`.
/// A missing file is success; the file is only rewritten when a line was
/// actually dropped.
fn filter_lines(
    path: &Path,
    keep: impl Fn(&str) -> bool,
) -> Result<(), ReconcileError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let kept: Vec<&str> = content.lines().filter(|line| keep(line)).collect();
    if kept.len() == content.lines().count() {
        return Ok(());
    }

    let mut rewritten = kept.join("\n");
    if content.ends_with('\n') {
        rewritten.push('\n');
    }
    std::fs::write(path, rewritten)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_lines_drops_only_matching_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(
            &hosts,
            "127.0.0.1 localhost\n192.0.2.10 ipfs-relay\n192.0.2.11 my-ipfs-relay-backup\n",
        )
        .unwrap();

        filter_lines(&hosts, |line| {
            !line.split_whitespace().any(|token| token == "ipfs-relay")
        })
        .unwrap();

        let content = std::fs::read_to_string(&hosts).unwrap();
        assert!(content.contains("localhost"));
        // exact-token decoy survives
        assert!(content.contains("my-ipfs-relay-backup"));
        assert!(!content.contains("192.0.2.10 ipfs-relay"));
    }

    #[test]
    fn filter_lines_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        filter_lines(&dir.path().join("absent"), |_| true).unwrap();
    }

    #[test]
    fn remove_file_if_present_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.service");
        std::fs::write(&path, "x").unwrap();

        remove_file_if_present(&path).unwrap();
        assert!(!path.exists());
        // second removal of the now-absent file is still success
        remove_file_if_present(&path).unwrap();
    }
}
