//! Convergence executor.
//!
//! Walks an [`ActionPlan`] in order and fails fast: the first failing
//! side-effecting step aborts the remainder. Nothing is rolled back — every
//! action is idempotent, so the recovery story for a half-applied pass is
//! simply a corrected re-run.

use std::path::Path;

use secrecy::SecretString;
use tracing::info;

use crate::artifact::ArtifactSource;
use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::firewall;
use crate::plan::{Action, ActionPlan};
use crate::proxy;
use crate::secrets;
use crate::service;
use crate::target::TargetState;

/// Result of a successful convergence pass.
#[derive(Debug)]
pub struct ConvergeOutcome {
    /// Rendered descriptions of the steps that ran, in order.
    pub applied: Vec<String>,
    /// Plaintext of a credential generated during this pass. `Some` for
    /// exactly the pass that generated it; the operator must capture it
    /// now, it is never recoverable from the hashed store.
    pub generated_credential: Option<SecretString>,
    /// Whether the plan contained no mutating step.
    pub noop: bool,
}

/// Plan executor for the convergence pass.
pub struct Applier<'a, R: CommandRunner, A: ArtifactSource> {
    runner: &'a R,
    artifacts: &'a A,
}

impl<'a, R: CommandRunner, A: ArtifactSource> Applier<'a, R, A> {
    pub const fn new(runner: &'a R, artifacts: &'a A) -> Self {
        Self { runner, artifacts }
    }

    /// Apply every action in order.
    ///
    /// # Errors
    ///
    /// Returns the first step failure; already-applied steps stay applied.
    pub fn apply(
        &self,
        target: &TargetState,
        plan: &ActionPlan,
    ) -> Result<ConvergeOutcome, ReconcileError> {
        let mut applied = Vec::with_capacity(plan.actions.len());
        let mut generated_credential = None;

        for action in &plan.actions {
            info!(step = %action, "applying");
            if let Some(secret) = self.apply_action(target, action)? {
                generated_credential = Some(secret);
            }
            applied.push(action.to_string());
        }

        Ok(ConvergeOutcome {
            applied,
            generated_credential,
            noop: plan.is_noop(),
        })
    }

    fn apply_action(
        &self,
        target: &TargetState,
        action: &Action,
    ) -> Result<Option<SecretString>, ReconcileError> {
        match action {
            Action::InstallPackages { packages } => {
                self.runner
                    .run_checked(&CommandSpec::new("apt-get").args(["update", "-q"]))?;
                self.runner.run_checked(
                    &CommandSpec::new("apt-get")
                        .args(["install", "-y", "-q"])
                        .args(packages.iter().cloned())
                        .env("DEBIAN_FRONTEND", "noninteractive"),
                )?;
            },
            Action::CreateUser { name, home } => {
                self.runner.run_checked(
                    &CommandSpec::new("useradd")
                        .args(["--system", "--user-group", "--shell", "/usr/sbin/nologin"])
                        .arg("--home-dir")
                        .arg(home.display().to_string())
                        .arg(name),
                )?;
            },
            Action::EnsureDir { path, mode } => {
                std::fs::create_dir_all(path)?;
                set_mode(path, *mode)?;
            },
            Action::InstallBinary { version, install_path } => {
                self.install_binary(target, version, install_path)?;
            },
            Action::InitRepo { repo_dir } => {
                self.runner.run_checked(
                    &CommandSpec::new(target.install_path.display().to_string())
                        .arg("init")
                        .env("IPFS_PATH", repo_dir.display().to_string()),
                )?;
            },
            Action::GenerateSwarmKey { path } => {
                secrets::write_swarm_key(path)?;
            },
            Action::ImportSwarmKey { from, to } => {
                secrets::import_swarm_key(from, to)?;
            },
            Action::ConfigureRepo => self.configure_repo(target)?,
            Action::GenerateCredential { user, htpasswd_path } => {
                let (password, generated) = match &target.supplied_password {
                    Some(supplied) => (supplied.clone(), false),
                    None => (secrets::generate_password(), true),
                };
                secrets::write_credential(self.runner, htpasswd_path, user, &password)?;
                return Ok(generated.then_some(password));
            },
            Action::GenerateTlsCert { .. } => {
                proxy::ensure_tls_cert(self.runner, target)?;
            },
            Action::WriteVhost { .. } => proxy::write_vhost(target)?,
            Action::EnsureSymlink { .. } => proxy::ensure_enabled_link(target)?,
            Action::SetOwnership { path, user } => {
                self.runner.run_checked(
                    &CommandSpec::new("chown")
                        .arg("-R")
                        .arg(format!("{user}:{user}"))
                        .arg(path.display().to_string()),
                )?;
            },
            Action::WriteUnitFile { .. } => service::write_unit(target)?,
            Action::DaemonReload => service::daemon_reload(self.runner)?,
            Action::EnableService { unit } => service::enable(self.runner, unit)?,
            Action::OpenFirewallPort { port } => firewall::allow_port(self.runner, *port)?,
            Action::ValidateProxyConfig => proxy::validate(self.runner)?,
            Action::RestartService { unit } => service::restart(self.runner, unit)?,
            Action::ReloadProxy => service::reload_or_restart(self.runner, proxy::PROXY_UNIT)?,
        }
        Ok(None)
    }

    fn install_binary(
        &self,
        target: &TargetState,
        version: &str,
        install_path: &Path,
    ) -> Result<(), ReconcileError> {
        let tarball = self.artifacts.fetch_verified(target)?;
        let staging = tarball
            .parent()
            .unwrap_or_else(|| Path::new("/tmp"))
            .join(format!("relayctl-extract-{version}"));
        std::fs::create_dir_all(&staging)?;

        self.runner.run_checked(
            &CommandSpec::new("tar")
                .arg("-xzf")
                .arg(tarball.display().to_string())
                .arg("-C")
                .arg(staging.display().to_string()),
        )?;

        // The published tarball unpacks to `kubo/ipfs`.
        let extracted = staging.join("kubo").join("ipfs");
        if let Some(parent) = install_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&extracted, install_path)?;
        set_mode(install_path, 0o755)?;

        let _ = std::fs::remove_dir_all(&staging);
        let _ = std::fs::remove_file(&tarball);
        info!(version, path = %install_path.display(), "installed node binary");
        Ok(())
    }

    fn configure_repo(&self, target: &TargetState) -> Result<(), ReconcileError> {
        let ipfs = target.install_path.display().to_string();
        let repo = target.repo_dir.display().to_string();

        let settings: [(&str, String, bool); 3] = [
            (
                "Addresses.API",
                format!("/ip4/127.0.0.1/tcp/{}", target.api_port),
                false,
            ),
            (
                "Addresses.Swarm",
                format!(
                    "[\"/ip4/0.0.0.0/tcp/{port}\",\"/ip6/::/tcp/{port}\"]",
                    port = target.swarm_port
                ),
                true,
            ),
            ("Swarm.RelayService.Enabled", "true".to_string(), true),
        ];

        for (key, value, json) in settings {
            let mut spec = CommandSpec::new(&ipfs)
                .arg("config")
                .env("IPFS_PATH", repo.clone());
            if json {
                spec = spec.arg("--json");
            }
            self.runner.run_checked(&spec.arg(key).arg(value))?;
        }
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), ReconcileError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use super::*;
    use crate::config::RelayConfig;
    use crate::exec::CommandOutput;
    use crate::gate::DistArch;
    use crate::target::InstallOverrides;

    struct FailOn {
        program: String,
        seen: RefCell<Vec<String>>,
    }

    impl CommandRunner for FailOn {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ReconcileError> {
            self.seen.borrow_mut().push(spec.program.clone());
            let status = i32::from(spec.program == self.program);
            Ok(CommandOutput {
                status,
                stdout: String::new(),
                stderr: "boom".to_string(),
            })
        }

        fn lookup(&self, _program: &str) -> Option<PathBuf> {
            Some(PathBuf::from("/usr/bin/true"))
        }
    }

    struct NoArtifacts;

    impl ArtifactSource for NoArtifacts {
        fn fetch_verified(&self, _target: &TargetState) -> Result<PathBuf, ReconcileError> {
            panic!("artifact source must not be consulted");
        }
    }

    fn target() -> TargetState {
        TargetState::resolve(
            &RelayConfig::default(),
            InstallOverrides::default(),
            DistArch::Amd64,
            Ipv4Addr::new(192, 0, 2, 10),
        )
    }

    #[test]
    fn first_failing_step_aborts_the_remainder() {
        let runner = FailOn {
            program: "systemctl".to_string(),
            seen: RefCell::new(Vec::new()),
        };
        let plan = ActionPlan {
            actions: vec![
                Action::DaemonReload,
                Action::EnableService {
                    unit: "ipfs-relay.service".to_string(),
                },
            ],
        };

        let err = Applier::new(&runner, &NoArtifacts)
            .apply(&target(), &plan)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::CommandFailed { .. }));
        // only the failing step ran; the enable was never attempted
        assert_eq!(runner.seen.borrow().len(), 1);
    }
}
