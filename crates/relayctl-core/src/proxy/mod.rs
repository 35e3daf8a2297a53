//! Reverse-proxy virtual host.
//!
//! The vhost file is deterministic output of [`TargetState`] and is
//! rewritten on every convergence pass; only the allow-listed API routes
//! are proxied, everything else gets 403. TLS is a self-signed pair
//! generated once via `openssl`; validation is `nginx -t`, and a failed
//! validation stops the proxy rather than reloading it into a known-bad
//! config.

use tracing::{info, warn};

use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::service;
use crate::target::{TargetState, ALLOWED_ROUTES};

/// Proxy unit name on the host.
pub const PROXY_UNIT: &str = "nginx.service";

const VHOST_HEADER: &str = "\
# Managed by relayctl; regenerated on every convergence pass.\n\
# Hand edits will be overwritten.\n";

/// Render the virtual-host file for a target.
#[must_use]
pub fn render_vhost(target: &TargetState) -> String {
    let mut out = String::from(VHOST_HEADER);
    out.push_str(&format!(
        "server {{\n\
         \x20   listen {port} ssl;\n\
         \x20   server_name {name};\n\
         \n\
         \x20   ssl_certificate {cert};\n\
         \x20   ssl_certificate_key {key};\n\
         \n\
         \x20   auth_basic \"IPFS relay\";\n\
         \x20   auth_basic_user_file {htpasswd};\n\
         \n",
        port = target.https_port,
        name = target.server_name,
        cert = target.tls_cert.display(),
        key = target.tls_key.display(),
        htpasswd = target.htpasswd_path.display(),
    ));

    for route in ALLOWED_ROUTES {
        out.push_str(&format!(
            "\x20   location = {route} {{\n\
             \x20       proxy_pass http://127.0.0.1:{api};\n\
             \x20       proxy_set_header Host $host;\n\
             \x20       proxy_set_header X-Forwarded-For $remote_addr;\n\
             \x20   }}\n\
             \n",
            api = target.api_port,
        ));
    }

    out.push_str(
        "\x20   location / {\n\
         \x20       return 403;\n\
         \x20   }\n\
         }\n",
    );
    out
}

/// Write the vhost file (mode 0644).
///
/// # Errors
///
/// Returns an I/O error when the file cannot be written.
pub fn write_vhost(target: &TargetState) -> Result<(), ReconcileError> {
    service::write_world_readable(&target.vhost_path, render_vhost(target).as_bytes())
}

/// Create the sites-enabled symlink when missing.
///
/// # Errors
///
/// Returns an I/O error when the link cannot be created.
pub fn ensure_enabled_link(target: &TargetState) -> Result<(), ReconcileError> {
    if target.enabled_link.exists() {
        return Ok(());
    }
    if let Some(parent) = target.enabled_link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target.vhost_path, &target.enabled_link)?;
    Ok(())
}

/// Generate the self-signed TLS pair when absent; private key mode 0600.
///
/// # Errors
///
/// Returns `DependencyMissing` when `openssl` is not installed, or the
/// command failure otherwise.
pub fn ensure_tls_cert<R: CommandRunner>(
    runner: &R,
    target: &TargetState,
) -> Result<(), ReconcileError> {
    if target.tls_cert.is_file() && target.tls_key.is_file() {
        return Ok(());
    }
    if let Some(parent) = target.tls_cert.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(cert = %target.tls_cert.display(), "generating self-signed TLS certificate");
    runner.run_checked(
        &CommandSpec::new("openssl")
            .args(["req", "-x509", "-nodes", "-newkey", "rsa:2048", "-days", "825"])
            .args(["-subj", &format!("/CN={}", target.server_name)])
            .arg("-keyout")
            .arg(target.tls_key.display().to_string())
            .arg("-out")
            .arg(target.tls_cert.display().to_string()),
    )?;

    #[cfg(unix)]
    if target.tls_key.is_file() {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&target.tls_key, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Run the proxy's own syntax check over the live configuration.
///
/// On failure the proxy is stopped: serving a stale config beats
/// reloading into a broken one, and a stopped proxy is loud enough for
/// the operator to notice.
///
/// # Errors
///
/// Returns `Validation` carrying the checker's stderr.
pub fn validate<R: CommandRunner>(runner: &R) -> Result<(), ReconcileError> {
    let out = runner.run(&CommandSpec::new("nginx").arg("-t"))?;
    if out.success() {
        return Ok(());
    }

    warn!("proxy configuration failed validation; stopping the proxy");
    if let Err(stop_err) = service::stop(runner, PROXY_UNIT) {
        warn!(error = %stop_err, "could not stop proxy after failed validation");
    }
    Err(ReconcileError::Validation {
        detail: out.stderr.trim().to_string(),
    })
}
