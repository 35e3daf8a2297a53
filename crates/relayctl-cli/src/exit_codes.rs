//! Process exit codes.
//!
//! Dedicated codes for the failure classes an operator scripts around;
//! everything else is a generic failure.

use relayctl_core::{ErrorKind, ReconcileError};

pub const SUCCESS: u8 = 0;
pub const FAILURE: u8 = 1;
pub const PRIVILEGE: u8 = 4;
pub const UNSUPPORTED_PLATFORM: u8 = 5;
pub const INTEGRITY: u8 = 6;
pub const VALIDATION: u8 = 7;
pub const LOCKED: u8 = 8;

/// Map an error chain to an exit code.
pub fn for_error(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ReconcileError>().map(ReconcileError::kind) {
        Some(ErrorKind::Privilege) => PRIVILEGE,
        Some(ErrorKind::UnsupportedPlatform) => UNSUPPORTED_PLATFORM,
        Some(ErrorKind::Integrity) => INTEGRITY,
        Some(ErrorKind::Validation) => VALIDATION,
        Some(ErrorKind::Locked) => LOCKED,
        Some(ErrorKind::Other) | None => FAILURE,
    }
}
