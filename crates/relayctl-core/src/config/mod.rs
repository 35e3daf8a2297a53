//! Operator configuration file.
//!
//! Everything has a default; a config file is only needed to move paths or
//! pin a checksum. CLI flags override file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level relayctl configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Kubo release selection and integrity pin.
    #[serde(default)]
    pub kubo: KuboSection,

    /// Relay node identity and layout.
    #[serde(default)]
    pub node: NodeSection,

    /// Reverse-proxy virtual host.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Pass-level runtime paths.
    #[serde(default)]
    pub runtime: RuntimeSection,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }
}

/// `[kubo]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KuboSection {
    /// Release version, without the `v` prefix.
    #[serde(default = "default_kubo_version")]
    pub version: String,

    /// Base URL of the dist site.
    #[serde(default = "default_dist_base_url")]
    pub dist_base_url: String,

    /// Pinned sha512 of the tarball. When unset the publisher's `.sha512`
    /// sidecar is fetched over the same endpoint.
    #[serde(default)]
    pub sha512: Option<String>,
}

impl Default for KuboSection {
    fn default() -> Self {
        Self {
            version: default_kubo_version(),
            dist_base_url: default_dist_base_url(),
            sha512: None,
        }
    }
}

/// `[node]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// System user the daemon runs as.
    #[serde(default = "default_user")]
    pub user: String,

    /// Home directory; the repository lives beneath it.
    #[serde(default = "default_home")]
    pub home: PathBuf,

    /// Where the `ipfs` binary is installed.
    #[serde(default = "default_install_path")]
    pub install_path: PathBuf,

    /// Public P2P swarm port.
    #[serde(default = "default_swarm_port")]
    pub swarm_port: u16,

    /// Loopback-only admin API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            user: default_user(),
            home: default_home(),
            install_path: default_install_path(),
            swarm_port: default_swarm_port(),
            api_port: default_api_port(),
        }
    }
}

/// `[proxy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// Advertised host name or address. Empty means "resolve the primary
    /// routed IPv4 address at the start of the pass".
    #[serde(default)]
    pub server_name: Option<String>,

    /// TLS listen port.
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Basic-auth account name.
    #[serde(default = "default_auth_user")]
    pub auth_user: String,

    /// Virtual-host file (sites-available).
    #[serde(default = "default_vhost_path")]
    pub vhost_path: PathBuf,

    /// Activation symlink (sites-enabled).
    #[serde(default = "default_enabled_link")]
    pub enabled_link: PathBuf,

    /// Hashed credential store consumed by the proxy.
    #[serde(default = "default_htpasswd_path")]
    pub htpasswd_path: PathBuf,

    /// Directory holding the self-signed certificate pair.
    #[serde(default = "default_tls_dir")]
    pub tls_dir: PathBuf,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            server_name: None,
            https_port: default_https_port(),
            auth_user: default_auth_user(),
            vhost_path: default_vhost_path(),
            enabled_link: default_enabled_link(),
            htpasswd_path: default_htpasswd_path(),
            tls_dir: default_tls_dir(),
        }
    }
}

/// `[runtime]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Advisory lock file held for the duration of a mutating pass.
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Systemd unit file for the relay service.
    #[serde(default = "default_unit_path")]
    pub unit_path: PathBuf,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            unit_path: default_unit_path(),
        }
    }
}

fn default_kubo_version() -> String {
    "0.29.0".to_string()
}

fn default_dist_base_url() -> String {
    "https://dist.ipfs.tech/kubo".to_string()
}

fn default_user() -> String {
    "ipfs".to_string()
}

fn default_home() -> PathBuf {
    PathBuf::from("/var/lib/ipfs")
}

fn default_install_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/ipfs")
}

const fn default_swarm_port() -> u16 {
    4001
}

const fn default_api_port() -> u16 {
    5001
}

const fn default_https_port() -> u16 {
    443
}

fn default_auth_user() -> String {
    "relay".to_string()
}

fn default_vhost_path() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available/ipfs-relay")
}

fn default_enabled_link() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled/ipfs-relay")
}

fn default_htpasswd_path() -> PathBuf {
    PathBuf::from("/etc/nginx/htpasswd-ipfs-relay")
}

fn default_tls_dir() -> PathBuf {
    PathBuf::from("/etc/ssl/ipfs-relay")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/relayctl.lock")
}

fn default_unit_path() -> PathBuf {
    PathBuf::from("/etc/systemd/system/ipfs-relay.service")
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config.node.user, "ipfs");
        assert_eq!(config.proxy.https_port, 443);
        assert_eq!(config.node.install_path, PathBuf::from("/usr/local/bin/ipfs"));
        assert!(config.kubo.sha512.is_none());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [kubo]
            version = "0.30.0"
            sha512 = "abc123"

            [proxy]
            https_port = 8443
            "#,
        )
        .unwrap();
        assert_eq!(config.kubo.version, "0.30.0");
        assert_eq!(config.kubo.sha512.as_deref(), Some("abc123"));
        assert_eq!(config.proxy.https_port, 8443);
        // untouched sections keep defaults
        assert_eq!(config.node.swarm_port, 4001);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let err = RelayConfig::from_toml("[kubo\nversion=").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
