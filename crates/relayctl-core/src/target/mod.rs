//! Declarative target state.
//!
//! A [`TargetState`] is resolved exactly once at the start of a pass from
//! the config file, CLI overrides, and environment probes, then treated as
//! immutable. Nothing downstream re-derives an ambient value mid-plan.

use std::net::{Ipv4Addr, UdpSocket};
use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::RelayConfig;
use crate::error::ReconcileError;
use crate::gate::DistArch;

/// Routes the proxy forwards to the node API; everything else is rejected
/// with 403.
pub const ALLOWED_ROUTES: [&str; 3] = ["/api/v0/pin/add", "/api/v0/pin/rm", "/api/v0/version"];

/// OS packages the convergence pass ensures are installed.
pub const REQUIRED_PACKAGES: [&str; 2] = ["nginx", "apache2-utils"];

/// Per-run overrides supplied on the command line.
#[derive(Debug, Default)]
pub struct InstallOverrides {
    /// Advertised address for the virtual host.
    pub target_ip: Option<String>,
    /// Basic-auth account name.
    pub user: Option<String>,
    /// Operator-chosen password; when unset a credential is generated on
    /// first convergence.
    pub password: Option<SecretString>,
    /// Pre-shared swarm key file to import.
    pub swarm_key: Option<PathBuf>,
    /// Kubo version to install.
    pub kubo_version: Option<String>,
}

/// Fully resolved desired end-state for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct TargetState {
    /// Kubo release version (no `v` prefix).
    pub kubo_version: String,
    /// Dist site base URL.
    pub dist_base_url: String,
    /// Pinned tarball sha512, when the operator provided one.
    pub pinned_sha512: Option<String>,
    /// Host architecture label for the dist tarball.
    pub arch: DistArch,

    /// Install path of the `ipfs` binary.
    pub install_path: PathBuf,
    /// Service user (and group) name.
    pub service_user: String,
    /// Service user home directory.
    pub home_dir: PathBuf,
    /// IPFS repository directory.
    pub repo_dir: PathBuf,
    /// Swarm key inside the repository.
    pub swarm_key_path: PathBuf,
    /// Operator-supplied swarm key to import instead of generating.
    pub operator_swarm_key: Option<PathBuf>,

    /// Systemd unit name.
    pub unit_name: String,
    /// Systemd unit file path.
    pub unit_path: PathBuf,

    /// Advertised server name (resolved address when not configured).
    pub server_name: String,
    /// TLS listen port.
    pub https_port: u16,
    /// Public P2P port.
    pub swarm_port: u16,
    /// Loopback-only API port.
    pub api_port: u16,
    /// Virtual-host file.
    pub vhost_path: PathBuf,
    /// Activation symlink.
    pub enabled_link: PathBuf,
    /// Hashed credential store.
    pub htpasswd_path: PathBuf,
    /// Basic-auth account name.
    pub auth_user: String,
    /// Operator-chosen password, if any.
    pub supplied_password: Option<SecretString>,
    /// TLS certificate path.
    pub tls_cert: PathBuf,
    /// TLS private key path.
    pub tls_key: PathBuf,

    /// Advisory lock file.
    pub lock_path: PathBuf,
}

impl TargetState {
    /// Resolve a target from config, overrides, and a pre-probed address.
    ///
    /// `primary_addr` is the fallback advertised address; callers that have
    /// an explicit `server_name` or `--target-ip` never consult it. Probing
    /// is the caller's job (see [`primary_ipv4`]) so this stays pure.
    #[must_use]
    pub fn resolve(
        config: &RelayConfig,
        overrides: InstallOverrides,
        arch: DistArch,
        primary_addr: Ipv4Addr,
    ) -> Self {
        let server_name = overrides
            .target_ip
            .or_else(|| config.proxy.server_name.clone())
            .unwrap_or_else(|| primary_addr.to_string());

        let repo_dir = config.node.home.join(".ipfs");
        let swarm_key_path = repo_dir.join("swarm.key");

        Self {
            kubo_version: overrides
                .kubo_version
                .unwrap_or_else(|| config.kubo.version.clone()),
            dist_base_url: config.kubo.dist_base_url.clone(),
            pinned_sha512: config.kubo.sha512.clone(),
            arch,
            install_path: config.node.install_path.clone(),
            service_user: config.node.user.clone(),
            home_dir: config.node.home.clone(),
            repo_dir,
            swarm_key_path,
            operator_swarm_key: overrides.swarm_key,
            unit_name: unit_name_for(&config.runtime.unit_path),
            unit_path: config.runtime.unit_path.clone(),
            server_name,
            https_port: config.proxy.https_port,
            swarm_port: config.node.swarm_port,
            api_port: config.node.api_port,
            vhost_path: config.proxy.vhost_path.clone(),
            enabled_link: config.proxy.enabled_link.clone(),
            htpasswd_path: config.proxy.htpasswd_path.clone(),
            auth_user: overrides.user.unwrap_or_else(|| config.proxy.auth_user.clone()),
            supplied_password: overrides.password,
            tls_cert: config.proxy.tls_dir.join("cert.pem"),
            tls_key: config.proxy.tls_dir.join("key.pem"),
            lock_path: config.runtime.lock_path.clone(),
        }
    }

    /// Tarball file name published on the dist site.
    #[must_use]
    pub fn dist_tarball(&self) -> String {
        format!(
            "kubo_v{}_linux-{}.tar.gz",
            self.kubo_version,
            self.arch.as_str()
        )
    }

    /// Full tarball URL.
    #[must_use]
    pub fn dist_url(&self) -> String {
        format!(
            "{}/v{}/{}",
            self.dist_base_url.trim_end_matches('/'),
            self.kubo_version,
            self.dist_tarball()
        )
    }

    /// URL of the publisher's sha512 sidecar.
    #[must_use]
    pub fn dist_checksum_url(&self) -> String {
        format!("{}.sha512", self.dist_url())
    }
}

fn unit_name_for(unit_path: &std::path::Path) -> String {
    unit_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ipfs-relay.service".to_string())
}

/// Probe the primary routed IPv4 address.
///
/// Opens a UDP socket toward a public address and reads the local address
/// the kernel picked; no packet is sent.
///
/// # Errors
///
/// Returns an I/O error when the host has no route at all.
pub fn primary_ipv4() -> Result<Ipv4Addr, ReconcileError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect(("1.1.1.1", 53))?;
    match socket.local_addr()? {
        std::net::SocketAddr::V4(v4) => Ok(*v4.ip()),
        std::net::SocketAddr::V6(_) => Ok(Ipv4Addr::LOCALHOST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(overrides: InstallOverrides) -> TargetState {
        TargetState::resolve(
            &RelayConfig::default(),
            overrides,
            DistArch::Amd64,
            Ipv4Addr::new(192, 0, 2, 10),
        )
    }

    #[test]
    fn probe_address_used_when_nothing_configured() {
        let target = resolved(InstallOverrides::default());
        assert_eq!(target.server_name, "192.0.2.10");
    }

    #[test]
    fn target_ip_override_wins_over_probe() {
        let target = resolved(InstallOverrides {
            target_ip: Some("198.51.100.7".into()),
            ..Default::default()
        });
        assert_eq!(target.server_name, "198.51.100.7");
    }

    #[test]
    fn dist_urls_follow_published_layout() {
        let target = resolved(InstallOverrides::default());
        assert_eq!(
            target.dist_url(),
            "https://dist.ipfs.tech/kubo/v0.29.0/kubo_v0.29.0_linux-amd64.tar.gz"
        );
        assert!(target.dist_checksum_url().ends_with(".tar.gz.sha512"));
    }

    #[test]
    fn repo_layout_derives_from_home() {
        let target = resolved(InstallOverrides::default());
        assert_eq!(target.repo_dir, PathBuf::from("/var/lib/ipfs/.ipfs"));
        assert_eq!(
            target.swarm_key_path,
            PathBuf::from("/var/lib/ipfs/.ipfs/swarm.key")
        );
        assert_eq!(target.unit_name, "ipfs-relay.service");
    }
}
