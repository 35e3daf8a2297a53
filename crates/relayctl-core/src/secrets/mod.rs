//! Secret material lifecycle.
//!
//! Both secrets — the proxy credential and the private-network swarm key —
//! are generated only when absent and reused verbatim forever after.
//! The credential is persisted exclusively in bcrypt-hashed form (via
//! `htpasswd -B`, delegated); its plaintext exists in memory behind
//! [`SecretString`] and is surfaced exactly once at generation time for
//! the operator to capture.

use std::path::Path;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::ReconcileError;
use crate::exec::{CommandRunner, CommandSpec};

/// Generated password length. Alphanumeric, so ~143 bits of entropy.
const PASSWORD_LEN: usize = 24;

/// Swarm key codec header expected by the node.
const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";

/// Generate a high-entropy password from the OS random source.
#[must_use]
pub fn generate_password() -> SecretString {
    let password: String = OsRng
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect();
    SecretString::new(password)
}

/// Render a fresh private-network key in the node's PSK file format.
#[must_use]
pub fn generate_swarm_key() -> String {
    let mut psk = [0_u8; 32];
    OsRng.fill_bytes(&mut psk);
    format!("{SWARM_KEY_HEADER}\n/base16/\n{}\n", hex::encode(psk))
}

/// Write a freshly generated swarm key at `path`, mode 0600.
///
/// Callers plan this only when the key is absent; an existing key is
/// never overwritten.
///
/// # Errors
///
/// Returns an I/O error when the key cannot be written.
pub fn write_swarm_key(path: &Path) -> Result<(), ReconcileError> {
    write_owner_only(path, generate_swarm_key().as_bytes())?;
    info!(path = %path.display(), "generated private-network key");
    Ok(())
}

/// Copy an operator-supplied swarm key into place, mode 0600.
///
/// # Errors
///
/// Returns `Validation` when the source is not a PSK file, or an I/O
/// error when it cannot be copied.
pub fn import_swarm_key(from: &Path, to: &Path) -> Result<(), ReconcileError> {
    let content = std::fs::read_to_string(from)?;
    if !content.starts_with(SWARM_KEY_HEADER) {
        return Err(ReconcileError::Validation {
            detail: format!(
                "{} is not a swarm key (missing {SWARM_KEY_HEADER} header)",
                from.display()
            ),
        });
    }
    write_owner_only(to, content.as_bytes())?;
    info!(from = %from.display(), to = %to.display(), "imported private-network key");
    Ok(())
}

/// Create the hashed credential store with a single entry.
///
/// Hashing is delegated to `htpasswd -B` (bcrypt); the plaintext goes to
/// the child over stdin and is never placed on a command line.
///
/// # Errors
///
/// Returns `DependencyMissing` when `htpasswd` is not installed, or the
/// command failure otherwise.
pub fn write_credential<R: CommandRunner>(
    runner: &R,
    htpasswd_path: &Path,
    user: &str,
    password: &SecretString,
) -> Result<(), ReconcileError> {
    if let Some(parent) = htpasswd_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    runner.run_checked(
        &CommandSpec::new("htpasswd")
            .args(["-B", "-i", "-c"])
            .arg(htpasswd_path.display().to_string())
            .arg(user)
            .stdin(password.expose_secret().as_bytes().to_vec()),
    )?;
    info!(path = %htpasswd_path.display(), user, "wrote hashed credential store");
    Ok(())
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<(), ReconcileError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;

    use super::*;
    use crate::exec::CommandOutput;

    #[test]
    fn generated_passwords_are_long_and_distinct() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.expose_secret().len(), PASSWORD_LEN);
        assert!(a.expose_secret().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn swarm_key_has_psk_format() {
        let key = generate_swarm_key();
        let lines: Vec<&str> = key.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], SWARM_KEY_HEADER);
        assert_eq!(lines[1], "/base16/");
        assert_eq!(lines[2].len(), 64);
        assert!(lines[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[cfg(unix)]
    #[test]
    fn written_key_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo/swarm.key");
        write_swarm_key(&path).unwrap();

        assert_eq!(crate::observe::file_mode(&path), Some(0o600));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(SWARM_KEY_HEADER));
    }

    #[test]
    fn import_rejects_non_psk_files() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("random.txt");
        std::fs::write(&from, "not a key").unwrap();

        let err = import_swarm_key(&from, &dir.path().join("swarm.key")).unwrap_err();
        assert!(matches!(err, ReconcileError::Validation { .. }));
    }

    #[test]
    fn import_copies_valid_keys_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("supplied.key");
        std::fs::write(&from, generate_swarm_key()).unwrap();
        let to = dir.path().join("repo/swarm.key");

        import_swarm_key(&from, &to).unwrap();
        assert_eq!(
            std::fs::read_to_string(&from).unwrap(),
            std::fs::read_to_string(&to).unwrap()
        );
        #[cfg(unix)]
        assert_eq!(crate::observe::file_mode(&to), Some(0o600));
    }

    /// Minimal runner capturing the specs it was asked to run.
    struct RecordingRunner {
        specs: RefCell<Vec<CommandSpec>>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ReconcileError> {
            self.specs.borrow_mut().push(spec.clone());
            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        fn lookup(&self, _program: &str) -> Option<PathBuf> {
            Some(PathBuf::from("/usr/bin/true"))
        }
    }

    #[test]
    fn credential_goes_to_htpasswd_over_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("htpasswd-ipfs-relay");
        let runner = RecordingRunner {
            specs: RefCell::new(Vec::new()),
        };
        let password = SecretString::new("hunter2hunter2".to_string());

        write_credential(&runner, &store, "relay", &password).unwrap();

        let specs = runner.specs.borrow();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.program, "htpasswd");
        assert!(spec.args.contains(&"-B".to_string()));
        assert_eq!(spec.stdin.as_deref(), Some("hunter2hunter2".as_bytes()));
        // plaintext never appears in the argument vector
        assert!(!spec.args.iter().any(|a| a.contains("hunter2")));
    }
}
