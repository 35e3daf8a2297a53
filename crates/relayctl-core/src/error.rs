//! Error taxonomy for reconciliation passes.
//!
//! Convergence errors are fatal and abort the remaining plan. Divergence
//! steps are best-effort; their failures are collected as [`Residue`]
//! records instead of propagating.

use std::path::PathBuf;

/// Fatal reconciliation error.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Not running with the required elevation.
    #[error("must run as root (current euid {euid}); re-run under sudo")]
    Privilege {
        /// Effective UID the process is running as.
        euid: u32,
    },

    /// Host OS or CPU architecture has no published Kubo build.
    #[error("unsupported platform {os}/{arch}; supported: linux/amd64, linux/arm64")]
    UnsupportedPlatform {
        /// Operating system name.
        os: String,
        /// CPU architecture name.
        arch: String,
    },

    /// Downloaded artifact failed its checksum verification.
    #[error("checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    Integrity {
        /// Artifact being verified (file name or URL).
        artifact: String,
        /// Publisher-declared digest (hex).
        expected: String,
        /// Digest computed over the downloaded bytes (hex).
        actual: String,
    },

    /// A tool required for a mutating step is not installed.
    #[error("required tool not found: {tool}")]
    DependencyMissing {
        /// Program name that could not be located.
        tool: String,
    },

    /// Generated configuration was rejected by the target system's own
    /// syntax check (e.g. `nginx -t`).
    #[error("configuration validation failed: {detail}")]
    Validation {
        /// Validator output.
        detail: String,
    },

    /// Another reconciliation pass holds the advisory lock.
    #[error("another relayctl pass is running (lock held at {path})")]
    Locked {
        /// Lock file path.
        path: PathBuf,
    },

    /// An external command exited non-zero.
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit status, or -1 when killed by signal.
        status: i32,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// An external command exceeded its deadline and was killed.
    #[error("`{command}` timed out after {seconds}s")]
    CommandTimeout {
        /// Rendered command line.
        command: String,
        /// Configured timeout.
        seconds: u64,
    },

    /// Artifact download failed before any bytes were verified.
    #[error("download of {url} failed: {detail}")]
    Download {
        /// Requested URL.
        url: String,
        /// Transport-level cause.
        detail: String,
    },

    /// Filesystem-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReconcileError {
    /// Short machine-readable kind, used for exit-code mapping.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Privilege { .. } => ErrorKind::Privilege,
            Self::UnsupportedPlatform { .. } => ErrorKind::UnsupportedPlatform,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::DependencyMissing { .. }
            | Self::CommandFailed { .. }
            | Self::CommandTimeout { .. }
            | Self::Download { .. }
            | Self::Io(_) => ErrorKind::Other,
        }
    }
}

/// Coarse error classification surfaced to the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing elevation.
    Privilege,
    /// No Kubo build for this host.
    UnsupportedPlatform,
    /// Checksum mismatch.
    Integrity,
    /// Generated config rejected by its validator.
    Validation,
    /// Advisory lock already held.
    Locked,
    /// Everything else.
    Other,
}

/// A teardown step that could not complete.
///
/// Divergence passes never abort; they record what they could not remove
/// and report the aggregate at the end of the run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Residue {
    /// Human-readable description of the step that failed.
    pub step: String,
    /// Why it failed.
    pub detail: String,
}

impl Residue {
    pub fn new(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_fatal_variants() {
        let err = ReconcileError::Privilege { euid: 1000 };
        assert_eq!(err.kind(), ErrorKind::Privilege);

        let err = ReconcileError::Integrity {
            artifact: "kubo.tar.gz".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn command_failed_display_includes_stderr() {
        let err = ReconcileError::CommandFailed {
            command: "nginx -t".into(),
            status: 1,
            stderr: "unexpected end of file".into(),
        };
        assert!(err.to_string().contains("unexpected end of file"));
    }
}
