//! Action planning.
//!
//! `plan_convergence` and `plan_teardown` are pure functions from
//! `(TargetState, ObservedState)` to an ordered plan. They touch nothing;
//! the executors in `apply` and `teardown` own the side effects. This split
//! is what makes the reconciliation policy testable without a machine.
//!
//! Convergence plans always end with the unconditional tail (unit refresh,
//! supervisor reload, validation, restart) so new configuration takes
//! effect even when every stateful step was a no-op; [`ActionPlan::is_noop`]
//! therefore looks only at the mutating subset.

use std::fmt;
use std::path::PathBuf;

use crate::observe::ObservedState;
use crate::target::TargetState;

/// One idempotent convergence step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Install missing OS packages.
    InstallPackages {
        /// Packages to install.
        packages: Vec<String>,
    },
    /// Create the system user and group.
    CreateUser {
        /// Account name.
        name: String,
        /// Home directory.
        home: PathBuf,
    },
    /// Create a directory with the given mode.
    EnsureDir {
        /// Directory path.
        path: PathBuf,
        /// Permission bits.
        mode: u32,
    },
    /// Download, verify, and install the node binary.
    InstallBinary {
        /// Release version.
        version: String,
        /// Install destination.
        install_path: PathBuf,
    },
    /// Initialize the node repository as the service user.
    InitRepo {
        /// Repository directory.
        repo_dir: PathBuf,
    },
    /// Generate a fresh private-network key (only planned when absent).
    GenerateSwarmKey {
        /// Key destination.
        path: PathBuf,
    },
    /// Import an operator-supplied private-network key (only when absent).
    ImportSwarmKey {
        /// Source file.
        from: PathBuf,
        /// Key destination.
        to: PathBuf,
    },
    /// Rewrite node addresses config from the target (pure regeneration).
    ConfigureRepo,
    /// Generate the proxy credential and write its hashed store entry
    /// (only planned when the store is absent).
    GenerateCredential {
        /// Account name.
        user: String,
        /// Credential store path.
        htpasswd_path: PathBuf,
    },
    /// Create the self-signed TLS pair (only when absent).
    GenerateTlsCert {
        /// Certificate path.
        cert: PathBuf,
        /// Private key path.
        key: PathBuf,
    },
    /// Rewrite the virtual-host file from the target (pure regeneration).
    WriteVhost {
        /// Virtual-host file path.
        path: PathBuf,
    },
    /// Ensure the vhost activation symlink exists.
    EnsureSymlink {
        /// Link path.
        link: PathBuf,
        /// Link target.
        target: PathBuf,
    },
    /// Re-assert ownership of the node home tree.
    SetOwnership {
        /// Tree root.
        path: PathBuf,
        /// Owner.
        user: String,
    },
    /// Rewrite the service unit file from the target (pure regeneration).
    WriteUnitFile {
        /// Unit file path.
        path: PathBuf,
    },
    /// Reload the supervisor's unit database.
    DaemonReload,
    /// Enable the service for boot.
    EnableService {
        /// Unit name.
        unit: String,
    },
    /// Open a firewall port.
    OpenFirewallPort {
        /// TCP port.
        port: u16,
    },
    /// Run the proxy's own config syntax check before reloading it.
    ValidateProxyConfig,
    /// Restart the node service.
    RestartService {
        /// Unit name.
        unit: String,
    },
    /// Reload the proxy so the regenerated vhost takes effect.
    ReloadProxy,
}

impl Action {
    /// Whether this action changes machine state beyond deterministic
    /// regeneration of config derived from the target.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        match self {
            Self::InstallPackages { .. }
            | Self::CreateUser { .. }
            | Self::EnsureDir { .. }
            | Self::InstallBinary { .. }
            | Self::InitRepo { .. }
            | Self::GenerateSwarmKey { .. }
            | Self::ImportSwarmKey { .. }
            | Self::GenerateCredential { .. }
            | Self::GenerateTlsCert { .. }
            | Self::EnsureSymlink { .. }
            | Self::OpenFirewallPort { .. } => true,
            Self::ConfigureRepo
            | Self::SetOwnership { .. }
            | Self::WriteVhost { .. }
            | Self::WriteUnitFile { .. }
            | Self::DaemonReload
            | Self::EnableService { .. }
            | Self::ValidateProxyConfig
            | Self::RestartService { .. }
            | Self::ReloadProxy => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstallPackages { packages } => {
                write!(f, "install packages {}", packages.join(", "))
            },
            Self::CreateUser { name, .. } => write!(f, "create system user {name}"),
            Self::EnsureDir { path, mode } => {
                write!(f, "create directory {} (mode {mode:o})", path.display())
            },
            Self::InstallBinary { version, install_path } => {
                write!(f, "install kubo v{version} to {}", install_path.display())
            },
            Self::InitRepo { repo_dir } => write!(f, "initialize repository {}", repo_dir.display()),
            Self::GenerateSwarmKey { path } => {
                write!(f, "generate swarm key {}", path.display())
            },
            Self::ImportSwarmKey { from, to } => {
                write!(f, "import swarm key {} -> {}", from.display(), to.display())
            },
            Self::ConfigureRepo => write!(f, "write node address configuration"),
            Self::GenerateCredential { user, htpasswd_path } => {
                write!(f, "generate credential for {user} in {}", htpasswd_path.display())
            },
            Self::GenerateTlsCert { cert, .. } => {
                write!(f, "generate self-signed TLS pair at {}", cert.display())
            },
            Self::WriteVhost { path } => write!(f, "write virtual host {}", path.display()),
            Self::EnsureSymlink { link, .. } => write!(f, "enable virtual host {}", link.display()),
            Self::SetOwnership { path, user } => {
                write!(f, "set ownership of {} to {user}", path.display())
            },
            Self::WriteUnitFile { path } => write!(f, "write service unit {}", path.display()),
            Self::DaemonReload => write!(f, "reload supervisor unit database"),
            Self::EnableService { unit } => write!(f, "enable {unit}"),
            Self::OpenFirewallPort { port } => write!(f, "open firewall port {port}/tcp"),
            Self::ValidateProxyConfig => write!(f, "validate proxy configuration"),
            Self::RestartService { unit } => write!(f, "restart {unit}"),
            Self::ReloadProxy => write!(f, "reload proxy"),
        }
    }
}

/// Ordered convergence plan.
#[derive(Debug, Clone, Default)]
pub struct ActionPlan {
    /// Steps in execution order.
    pub actions: Vec<Action>,
}

impl ActionPlan {
    /// True when the plan contains no state-mutating step, i.e. the host
    /// already satisfies the target and only the unconditional refresh
    /// tail remains.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.actions.iter().any(Action::is_mutating)
    }

    /// Number of mutating steps.
    #[must_use]
    pub fn mutating_len(&self) -> usize {
        self.actions.iter().filter(|a| a.is_mutating()).count()
    }
}

/// Diff observed state against the target and emit the convergence plan.
#[must_use]
pub fn plan_convergence(target: &TargetState, observed: &ObservedState) -> ActionPlan {
    let mut actions = Vec::new();

    if !observed.missing_packages.is_empty() {
        actions.push(Action::InstallPackages {
            packages: observed.missing_packages.clone(),
        });
    }

    // Identities are created, never mutated; an existing user keeps
    // whatever properties it has.
    if !observed.user_exists {
        actions.push(Action::CreateUser {
            name: target.service_user.clone(),
            home: target.home_dir.clone(),
        });
    }

    if !observed.home_dir_exists {
        actions.push(Action::EnsureDir {
            path: target.home_dir.clone(),
            mode: 0o750,
        });
    }

    if !observed.binary_at_version(&target.kubo_version) {
        actions.push(Action::InstallBinary {
            version: target.kubo_version.clone(),
            install_path: target.install_path.clone(),
        });
    }

    if !observed.repo_initialized {
        actions.push(Action::InitRepo {
            repo_dir: target.repo_dir.clone(),
        });
    }

    // Secret material is reused verbatim whenever it already exists;
    // regenerating would cut off every peer holding the old key.
    if !observed.swarm_key_present {
        match &target.operator_swarm_key {
            Some(from) => actions.push(Action::ImportSwarmKey {
                from: from.clone(),
                to: target.swarm_key_path.clone(),
            }),
            None => actions.push(Action::GenerateSwarmKey {
                path: target.swarm_key_path.clone(),
            }),
        }
    }

    actions.push(Action::ConfigureRepo);

    // Repo edits above may run as root; re-assert ownership every pass so
    // the daemon (running unprivileged) can always read its own tree.
    actions.push(Action::SetOwnership {
        path: target.home_dir.clone(),
        user: target.service_user.clone(),
    });

    if !observed.htpasswd_present {
        actions.push(Action::GenerateCredential {
            user: target.auth_user.clone(),
            htpasswd_path: target.htpasswd_path.clone(),
        });
    }

    if !(observed.tls_cert_present && observed.tls_key_present) {
        actions.push(Action::GenerateTlsCert {
            cert: target.tls_cert.clone(),
            key: target.tls_key.clone(),
        });
    }

    actions.push(Action::WriteVhost {
        path: target.vhost_path.clone(),
    });

    if !observed.enabled_link_present {
        actions.push(Action::EnsureSymlink {
            link: target.enabled_link.clone(),
            target: target.vhost_path.clone(),
        });
    }

    actions.push(Action::WriteUnitFile {
        path: target.unit_path.clone(),
    });
    actions.push(Action::DaemonReload);
    actions.push(Action::EnableService {
        unit: target.unit_name.clone(),
    });

    if observed.firewall.https_open != Some(true) {
        actions.push(Action::OpenFirewallPort {
            port: target.https_port,
        });
    }
    if observed.firewall.swarm_open != Some(true) {
        actions.push(Action::OpenFirewallPort {
            port: target.swarm_port,
        });
    }

    // Terminal tail: validate before the proxy picks the config up, then
    // always (re)start so a successful pass leaves the new state live.
    actions.push(Action::ValidateProxyConfig);
    actions.push(Action::RestartService {
        unit: target.unit_name.clone(),
    });
    actions.push(Action::ReloadProxy);

    ActionPlan { actions }
}

/// One best-effort divergence step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownStep {
    /// Stop the service.
    StopService {
        /// Unit name.
        unit: String,
    },
    /// Disable the service.
    DisableService {
        /// Unit name.
        unit: String,
    },
    /// Terminate stray processes still running the installed binary.
    KillStray {
        /// Binary path to match exactly.
        binary: PathBuf,
    },
    /// Delete a file or symlink.
    RemoveFile {
        /// Path to delete.
        path: PathBuf,
    },
    /// Delete a directory tree.
    RemoveDir {
        /// Tree root.
        path: PathBuf,
    },
    /// Delete the system user.
    RemoveUser {
        /// Account name.
        name: String,
    },
    /// Remove a firewall port rule.
    CloseFirewallPort {
        /// TCP port.
        port: u16,
    },
    /// Reload the supervisor's unit database.
    DaemonReload,
    /// Reload the proxy after its vhost went away.
    ReloadProxy,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopService { unit } => write!(f, "stop {unit}"),
            Self::DisableService { unit } => write!(f, "disable {unit}"),
            Self::KillStray { binary } => {
                write!(f, "terminate stray {} processes", binary.display())
            },
            Self::RemoveFile { path } => write!(f, "remove {}", path.display()),
            Self::RemoveDir { path } => write!(f, "remove directory {}", path.display()),
            Self::RemoveUser { name } => write!(f, "remove user {name}"),
            Self::CloseFirewallPort { port } => write!(f, "close firewall port {port}/tcp"),
            Self::DaemonReload => write!(f, "reload supervisor unit database"),
            Self::ReloadProxy => write!(f, "reload proxy"),
        }
    }
}

/// Removal blast radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalScope {
    /// Exactly the artifact set this tool provisions.
    #[default]
    Tracked,
    /// Tracked set plus a narrow sweep of well-known residue locations.
    Comprehensive,
}

/// Ordered divergence plan.
#[derive(Debug, Clone)]
pub struct TeardownPlan {
    /// Steps in execution order.
    pub steps: Vec<TeardownStep>,
    /// Residue sweep appended after the tracked steps, comprehensive
    /// scope only.
    pub sweep: Option<crate::teardown::SweepSpec>,
}

/// Build the inverse plan.
///
/// The plan is constructed unconditionally (every step tolerates an
/// already-absent target), with one hard ordering rule baked into the
/// construction: services stop and stray processes die before anything
/// they hold open is deleted, and firewall/unit cleanup happens after the
/// stop so a restart race cannot reopen a port mid-teardown.
#[must_use]
pub fn plan_teardown(target: &TargetState, scope: RemovalScope, purge: bool) -> TeardownPlan {
    let mut steps = vec![
        TeardownStep::StopService {
            unit: target.unit_name.clone(),
        },
        TeardownStep::DisableService {
            unit: target.unit_name.clone(),
        },
        TeardownStep::KillStray {
            binary: target.install_path.clone(),
        },
        TeardownStep::RemoveFile {
            path: target.unit_path.clone(),
        },
        TeardownStep::DaemonReload,
        TeardownStep::RemoveFile {
            path: target.enabled_link.clone(),
        },
        TeardownStep::RemoveFile {
            path: target.vhost_path.clone(),
        },
        TeardownStep::ReloadProxy,
        TeardownStep::RemoveFile {
            path: target.install_path.clone(),
        },
        TeardownStep::CloseFirewallPort {
            port: target.https_port,
        },
        TeardownStep::CloseFirewallPort {
            port: target.swarm_port,
        },
        TeardownStep::RemoveUser {
            name: target.service_user.clone(),
        },
    ];

    if purge {
        steps.push(TeardownStep::RemoveFile {
            path: target.htpasswd_path.clone(),
        });
        steps.push(TeardownStep::RemoveFile {
            path: target.tls_cert.clone(),
        });
        steps.push(TeardownStep::RemoveFile {
            path: target.tls_key.clone(),
        });
        steps.push(TeardownStep::RemoveDir {
            path: target.home_dir.clone(),
        });
    }

    let sweep = match scope {
        RemovalScope::Tracked => None,
        RemovalScope::Comprehensive => Some(crate::teardown::SweepSpec::for_target(target)),
    };

    TeardownPlan { steps, sweep }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;

    use super::*;
    use crate::config::RelayConfig;
    use crate::firewall::FirewallState;
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

    fn converged_observation(target: &TargetState) -> ObservedState {
        ObservedState {
            missing_packages: Vec::new(),
            binary_version: Some(target.kubo_version.clone()),
            user_exists: true,
            home_dir_exists: true,
            repo_initialized: true,
            swarm_key_present: true,
            swarm_key_mode: Some(0o600),
            unit_file_present: true,
            service_active: true,
            service_enabled: true,
            vhost_present: true,
            enabled_link_present: true,
            htpasswd_present: true,
            tls_cert_present: true,
            tls_key_present: true,
            tls_key_mode: Some(0o600),
            firewall: FirewallState {
                backend: None,
                https_open: Some(true),
                swarm_open: Some(true),
            },
        }
    }

    /// Pure model of applying a plan to an observation; mirrors what the
    /// executor does to the machine.
    fn simulate(target: &TargetState, mut observed: ObservedState, plan: &ActionPlan) -> ObservedState {
        for action in &plan.actions {
            match action {
                Action::InstallPackages { .. } => observed.missing_packages.clear(),
                Action::CreateUser { .. } => observed.user_exists = true,
                Action::EnsureDir { .. } => observed.home_dir_exists = true,
                Action::InstallBinary { version, .. } => {
                    observed.binary_version = Some(version.clone());
                },
                Action::InitRepo { .. } => {
                    observed.repo_initialized = true;
                    observed.home_dir_exists = true;
                },
                Action::GenerateSwarmKey { .. } | Action::ImportSwarmKey { .. } => {
                    observed.swarm_key_present = true;
                    observed.swarm_key_mode = Some(0o600);
                },
                Action::GenerateCredential { .. } => observed.htpasswd_present = true,
                Action::GenerateTlsCert { .. } => {
                    observed.tls_cert_present = true;
                    observed.tls_key_present = true;
                    observed.tls_key_mode = Some(0o600);
                },
                Action::WriteVhost { .. } => observed.vhost_present = true,
                Action::EnsureSymlink { .. } => observed.enabled_link_present = true,
                Action::WriteUnitFile { .. } => observed.unit_file_present = true,
                Action::EnableService { .. } => observed.service_enabled = true,
                Action::OpenFirewallPort { port } => {
                    if *port == target.https_port {
                        observed.firewall.https_open = Some(true);
                    }
                    if *port == target.swarm_port {
                        observed.firewall.swarm_open = Some(true);
                    }
                },
                Action::RestartService { .. } => observed.service_active = true,
                Action::ConfigureRepo
                | Action::SetOwnership { .. }
                | Action::DaemonReload
                | Action::ValidateProxyConfig
                | Action::ReloadProxy => {},
            }
        }
        observed
    }

    #[test]
    fn fresh_host_plans_full_install() {
        let target = target();
        let observed = ObservedState {
            missing_packages: vec!["nginx".into(), "apache2-utils".into()],
            ..Default::default()
        };
        let plan = plan_convergence(&target, &observed);

        assert!(!plan.is_noop());
        assert!(plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::InstallBinary { .. })));
        assert!(plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::GenerateSwarmKey { .. })));
        // terminal tail is always present and ordered last
        let n = plan.actions.len();
        assert_eq!(plan.actions[n - 3], Action::ValidateProxyConfig);
        assert!(matches!(plan.actions[n - 2], Action::RestartService { .. }));
        assert_eq!(plan.actions[n - 1], Action::ReloadProxy);
    }

    #[test]
    fn converged_host_plans_noop() {
        let target = target();
        let plan = plan_convergence(&target, &converged_observation(&target));
        assert!(plan.is_noop());
        assert_eq!(plan.mutating_len(), 0);
        // the refresh tail still runs
        assert!(plan.actions.contains(&Action::ValidateProxyConfig));
        assert!(plan.actions.contains(&Action::ReloadProxy));
    }

    #[test]
    fn existing_swarm_key_is_never_touched() {
        let target = target();
        let mut observed = converged_observation(&target);
        observed.binary_version = None; // force other work

        let plan = plan_convergence(&target, &observed);
        assert!(!plan.actions.iter().any(|a| {
            matches!(a, Action::GenerateSwarmKey { .. } | Action::ImportSwarmKey { .. })
        }));
    }

    #[test]
    fn operator_key_is_imported_not_generated() {
        let mut target = target();
        target.operator_swarm_key = Some(PathBuf::from("/root/swarm.key"));
        let observed = ObservedState::default();

        let plan = plan_convergence(&target, &observed);
        assert!(plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::ImportSwarmKey { .. })));
        assert!(!plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::GenerateSwarmKey { .. })));
    }

    #[test]
    fn version_mismatch_reinstalls_binary() {
        let target = target();
        let mut observed = converged_observation(&target);
        observed.binary_version = Some("0.21.0".into());

        let plan = plan_convergence(&target, &observed);
        assert!(plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::InstallBinary { .. })));
    }

    #[test]
    fn unknown_firewall_state_still_plans_the_rule() {
        let target = target();
        let mut observed = converged_observation(&target);
        observed.firewall = FirewallState::default();

        let plan = plan_convergence(&target, &observed);
        let ports: Vec<u16> = plan
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::OpenFirewallPort { port } => Some(*port),
                _ => None,
            })
            .collect();
        assert_eq!(ports, vec![target.https_port, target.swarm_port]);
    }

    #[test]
    fn teardown_stops_before_deleting() {
        let target = target();
        let plan = plan_teardown(&target, RemovalScope::Tracked, true);

        let stop = plan
            .steps
            .iter()
            .position(|s| matches!(s, TeardownStep::StopService { .. }))
            .expect("stop step");
        let kill = plan
            .steps
            .iter()
            .position(|s| matches!(s, TeardownStep::KillStray { .. }))
            .expect("kill step");
        let binary_delete = plan
            .steps
            .iter()
            .position(|s| matches!(s, TeardownStep::RemoveFile { path } if *path == target.install_path))
            .expect("binary delete step");
        let data_delete = plan
            .steps
            .iter()
            .position(|s| matches!(s, TeardownStep::RemoveDir { path } if *path == target.home_dir))
            .expect("data delete step");
        let firewall_close = plan
            .steps
            .iter()
            .position(|s| matches!(s, TeardownStep::CloseFirewallPort { .. }))
            .expect("firewall step");

        assert!(stop < kill);
        assert!(kill < binary_delete);
        assert!(stop < data_delete);
        assert!(stop < firewall_close);
    }

    #[test]
    fn tracked_scope_keeps_secrets_and_data() {
        let target = target();
        let plan = plan_teardown(&target, RemovalScope::Tracked, false);

        assert!(!plan
            .steps
            .iter()
            .any(|s| matches!(s, TeardownStep::RemoveDir { .. })));
        assert!(!plan.steps.iter().any(
            |s| matches!(s, TeardownStep::RemoveFile { path } if *path == target.htpasswd_path)
        ));
        assert!(plan.sweep.is_none());
    }

    #[test]
    fn purge_removes_secrets_and_data() {
        let target = target();
        let plan = plan_teardown(&target, RemovalScope::Comprehensive, true);

        assert!(plan.steps.iter().any(
            |s| matches!(s, TeardownStep::RemoveFile { path } if *path == target.htpasswd_path)
        ));
        assert!(plan
            .steps
            .iter()
            .any(|s| matches!(s, TeardownStep::RemoveDir { path } if *path == target.home_dir)));
        assert!(plan.sweep.is_some());
    }

    proptest! {
        /// Applying a plan and re-planning always converges to a no-op.
        #[test]
        fn replan_after_apply_is_noop(
            pkgs_missing in any::<bool>(),
            binary in prop_oneof![
                Just(None),
                Just(Some("0.21.0".to_string())),
                Just(Some("0.29.0".to_string())),
            ],
            user_exists in any::<bool>(),
            home in any::<bool>(),
            repo in any::<bool>(),
            key in any::<bool>(),
            unit in any::<bool>(),
            active in any::<bool>(),
            enabled in any::<bool>(),
            vhost in any::<bool>(),
            link in any::<bool>(),
            htpasswd in any::<bool>(),
            cert in any::<bool>(),
            tls_key in any::<bool>(),
            https_open in prop_oneof![Just(None), Just(Some(false)), Just(Some(true))],
            swarm_open in prop_oneof![Just(None), Just(Some(false)), Just(Some(true))],
        ) {
            let target = target();
            let observed = ObservedState {
                missing_packages: if pkgs_missing { vec!["nginx".into()] } else { Vec::new() },
                binary_version: binary,
                user_exists,
                home_dir_exists: home,
                repo_initialized: repo,
                swarm_key_present: key,
                swarm_key_mode: key.then_some(0o600),
                unit_file_present: unit,
                service_active: active,
                service_enabled: enabled,
                vhost_present: vhost,
                enabled_link_present: link,
                htpasswd_present: htpasswd,
                tls_cert_present: cert,
                tls_key_present: tls_key,
                tls_key_mode: tls_key.then_some(0o600),
                firewall: FirewallState { backend: None, https_open, swarm_open },
            };

            let plan = plan_convergence(&target, &observed);
            let after = simulate(&target, observed, &plan);
            let replan = plan_convergence(&target, &after);
            prop_assert!(replan.is_noop(), "second plan not a no-op: {:?}", replan.actions);
        }
    }
}
