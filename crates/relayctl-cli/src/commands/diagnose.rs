//! `relayctl diagnose` — read-only health report.

use anyhow::{Context, Result};
use relayctl_core::config::RelayConfig;
use relayctl_core::diagnose;
use relayctl_core::exec::SystemRunner;
use relayctl_core::observe::SystemInspector;
use relayctl_core::target::InstallOverrides;

pub fn run(config: &RelayConfig, json: bool, verbose: bool) -> Result<()> {
    // No privilege gate: the probe mutates nothing and should work for
    // any operator who can read the paths involved.
    let target = super::resolve_target(
        config,
        InstallOverrides::default(),
        Some(std::net::Ipv4Addr::LOCALHOST),
    )?;

    let runner = SystemRunner::new();
    let inspector = SystemInspector::new(&runner);
    let report = diagnose::run(&inspector, &runner, &target, verbose)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        print!("{}", diagnose::render_human(&report));
    }

    Ok(())
}
