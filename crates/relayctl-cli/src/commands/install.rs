//! `relayctl install` — the convergence pass.

use std::path::PathBuf;

use anyhow::{Context, Result};
use relayctl_core::artifact::HttpArtifactSource;
use relayctl_core::config::RelayConfig;
use relayctl_core::exec::SystemRunner;
use relayctl_core::gate;
use relayctl_core::lock::PassLock;
use relayctl_core::observe::SystemInspector;
use relayctl_core::target::InstallOverrides;
use relayctl_core::{converge, preview};
use secrecy::{ExposeSecret, SecretString};

/// Flags for `relayctl install`.
pub struct Args {
    pub target_ip: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub swarm_key: Option<PathBuf>,
    pub kubo_version: Option<String>,
    pub dry_run: bool,
}

pub fn run(config: &RelayConfig, args: Args) -> Result<()> {
    let overrides = InstallOverrides {
        target_ip: args.target_ip,
        user: args.user,
        password: args.password.map(SecretString::new),
        swarm_key: args.swarm_key,
        kubo_version: args.kubo_version,
    };
    let target = super::resolve_target(config, overrides, None)?;

    let runner = SystemRunner::new();
    let inspector = SystemInspector::new(&runner);

    if args.dry_run {
        let plan = preview(&inspector, &target)?;
        if plan.is_noop() {
            println!("host already satisfies the target; nothing to change");
        } else {
            println!("would apply {} mutating steps:", plan.mutating_len());
        }
        for action in &plan.actions {
            let marker = if action.is_mutating() { "*" } else { " " };
            println!("  {marker} {action}");
        }
        return Ok(());
    }

    gate::require_root()?;
    let _lock = PassLock::acquire(&target.lock_path)?;

    let artifacts = HttpArtifactSource::new()?;
    let summary = converge(&inspector, &runner, &artifacts, &target)
        .context("convergence pass failed; re-run after fixing the cause to complete it")?;

    if summary.already_converged {
        println!("already converged; services refreshed");
    } else {
        println!("converged ({} mutating steps applied)", summary.mutating_steps);
    }
    println!(
        "relay endpoint: https://{}:{} (user {})",
        target.server_name, target.https_port, target.auth_user
    );

    if let Some(credential) = &summary.generated_credential {
        // Printed exactly once; the stored form is hashed and cannot be
        // recovered later.
        println!();
        println!("generated proxy credential (save it now, it will not be shown again):");
        println!("  user:     {}", target.auth_user);
        println!("  password: {}", credential.expose_secret());
    }

    Ok(())
}
