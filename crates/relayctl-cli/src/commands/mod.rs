//! Subcommand implementations.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use relayctl_core::config::RelayConfig;
use relayctl_core::gate;
use relayctl_core::target::{self, InstallOverrides, TargetState};

pub mod diagnose;
pub mod install;
pub mod remove;

/// Load the config file, or defaults when none was given.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(RelayConfig::default()),
    }
}

/// Resolve the full target for a pass.
///
/// The primary-address probe only runs when neither the config nor the
/// overrides name an address; diagnose passes a `fallback` so a host with
/// no route still gets a report.
pub fn resolve_target(
    config: &RelayConfig,
    overrides: InstallOverrides,
    fallback: Option<Ipv4Addr>,
) -> Result<TargetState> {
    let arch = gate::require_supported_platform()?;

    let addr = if overrides.target_ip.is_none() && config.proxy.server_name.is_none() {
        match fallback {
            Some(addr) => target::primary_ipv4().unwrap_or(addr),
            None => target::primary_ipv4().context("could not determine the primary IPv4 address; pass --target-ip")?,
        }
    } else {
        Ipv4Addr::LOCALHOST
    };

    Ok(TargetState::resolve(config, overrides, arch, addr))
}
