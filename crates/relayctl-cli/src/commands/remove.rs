//! `relayctl remove` — the divergence pass.
//!
//! Best-effort by design: the pass never aborts partway, and an exit code
//! of 0 with a residue listing means "removed everything I could".

use anyhow::Result;
use relayctl_core::config::RelayConfig;
use relayctl_core::diverge;
use relayctl_core::exec::SystemRunner;
use relayctl_core::gate;
use relayctl_core::lock::PassLock;
use relayctl_core::plan::RemovalScope;
use relayctl_core::target::InstallOverrides;

pub fn run(config: &RelayConfig, scope: RemovalScope, purge: bool) -> Result<()> {
    gate::require_root()?;

    let target = super::resolve_target(
        config,
        InstallOverrides::default(),
        Some(std::net::Ipv4Addr::LOCALHOST),
    )?;
    let _lock = PassLock::acquire(&target.lock_path)?;

    let report = diverge(&SystemRunner::new(), &target, scope, purge);

    println!("removed {} artifacts", report.removed.len());
    if !report.is_clean() {
        eprintln!();
        eprintln!("could not remove:");
        for residue in &report.residue {
            eprintln!("  {} ({})", residue.step, residue.detail);
        }
    }

    Ok(())
}
