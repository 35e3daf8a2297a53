//! Entry gates: privilege and platform checks.
//!
//! Both run once at the start of a mutating pass, before any side effect.
//! The historical pattern of re-exec'ing under sudo is replaced by a hard
//! failure telling the operator what to do.

use crate::error::ReconcileError;

/// Kubo dist architecture label for this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistArch {
    /// `amd64` build.
    Amd64,
    /// `arm64` build.
    Arm64,
}

impl DistArch {
    /// Label used in the published tarball names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }
}

/// Fail unless running with effective UID 0.
///
/// # Errors
///
/// Returns `Privilege` with the current euid otherwise.
pub fn require_root() -> Result<(), ReconcileError> {
    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(ReconcileError::Privilege {
            euid: euid.as_raw(),
        })
    }
}

/// Map the compile-target platform to a Kubo dist architecture.
///
/// # Errors
///
/// Returns `UnsupportedPlatform` for anything without a published build.
pub fn require_supported_platform() -> Result<DistArch, ReconcileError> {
    dist_arch(std::env::consts::OS, std::env::consts::ARCH)
}

fn dist_arch(os: &str, arch: &str) -> Result<DistArch, ReconcileError> {
    match (os, arch) {
        ("linux", "x86_64") => Ok(DistArch::Amd64),
        ("linux", "aarch64") => Ok(DistArch::Arm64),
        _ => Err(ReconcileError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_architectures_map_to_dist_labels() {
        assert_eq!(dist_arch("linux", "x86_64").unwrap(), DistArch::Amd64);
        assert_eq!(dist_arch("linux", "aarch64").unwrap(), DistArch::Arm64);
    }

    #[test]
    fn other_platforms_are_rejected() {
        assert!(matches!(
            dist_arch("macos", "aarch64"),
            Err(ReconcileError::UnsupportedPlatform { .. })
        ));
        assert!(matches!(
            dist_arch("linux", "riscv64"),
            Err(ReconcileError::UnsupportedPlatform { .. })
        ));
    }
}
