//! Release artifact fetch and integrity gate.
//!
//! The tarball is verified against the publisher's sha512 (a pinned value
//! from config, or the `.sha512` sidecar next to the tarball) before
//! anything is extracted. A mismatch is a hard failure: the unverified
//! bytes never reach the installer.

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha512};
use tracing::info;

use crate::error::ReconcileError;
use crate::target::TargetState;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Source of verified release tarballs.
pub trait ArtifactSource {
    /// Fetch and verify the tarball for the target's version, returning
    /// the path of the verified local copy.
    ///
    /// # Errors
    ///
    /// Returns `Download` on transport failure and `Integrity` on a
    /// checksum mismatch.
    fn fetch_verified(&self, target: &TargetState) -> Result<PathBuf, ReconcileError>;
}

/// Production source backed by the dist HTTPS endpoint.
pub struct HttpArtifactSource {
    client: reqwest::blocking::Client,
    staging_dir: PathBuf,
}

impl HttpArtifactSource {
    /// Create a source staging downloads under the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns `Download` when the HTTP client cannot be constructed.
    pub fn new() -> Result<Self, ReconcileError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| ReconcileError::Download {
                url: String::new(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            staging_dir: std::env::temp_dir(),
        })
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ReconcileError> {
        let response = self
            .client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| ReconcileError::Download {
                url: url.to_string(),
                detail: e.to_string(),
            })?;
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| ReconcileError::Download {
                url: url.to_string(),
                detail: e.to_string(),
            })
    }
}

impl ArtifactSource for HttpArtifactSource {
    fn fetch_verified(&self, target: &TargetState) -> Result<PathBuf, ReconcileError> {
        let url = target.dist_url();
        info!(%url, "downloading release tarball");
        let bytes = self.get_bytes(&url)?;

        let expected = match &target.pinned_sha512 {
            Some(pinned) => pinned.clone(),
            None => {
                let sidecar_url = target.dist_checksum_url();
                let sidecar = self.get_bytes(&sidecar_url)?;
                let text = String::from_utf8_lossy(&sidecar);
                parse_checksum_sidecar(&text).ok_or_else(|| ReconcileError::Download {
                    url: sidecar_url,
                    detail: "checksum sidecar is empty or malformed".to_string(),
                })?
            },
        };

        verify_sha512(&bytes, &expected, &target.dist_tarball())?;

        let path = self.staging_dir.join(target.dist_tarball());
        std::fs::write(&path, &bytes)?;
        Ok(path)
    }
}

/// Verify bytes against an expected hex sha512 digest.
///
/// # Errors
///
/// Returns `Integrity` on mismatch.
pub fn verify_sha512(bytes: &[u8], expected: &str, artifact: &str) -> Result<(), ReconcileError> {
    let actual = hex::encode(Sha512::digest(bytes));
    let expected = expected.trim().to_ascii_lowercase();
    if actual == expected {
        Ok(())
    } else {
        Err(ReconcileError::Integrity {
            artifact: artifact.to_string(),
            expected,
            actual,
        })
    }
}

/// Extract the digest from a `sha512sum`-style sidecar line
/// (`<hex>  <filename>`).
#[must_use]
pub fn parse_checksum_sidecar(content: &str) -> Option<String> {
    content
        .split_whitespace()
        .next()
        .filter(|token| token.len() == 128 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|token| token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"relay tarball bytes";

    fn digest_of(bytes: &[u8]) -> String {
        hex::encode(Sha512::digest(bytes))
    }

    #[test]
    fn matching_digest_verifies() {
        verify_sha512(PAYLOAD, &digest_of(PAYLOAD), "kubo.tar.gz").unwrap();
    }

    #[test]
    fn digest_comparison_is_case_insensitive() {
        let upper = digest_of(PAYLOAD).to_ascii_uppercase();
        verify_sha512(PAYLOAD, &upper, "kubo.tar.gz").unwrap();
    }

    #[test]
    fn corrupted_bytes_fail_the_gate() {
        let err = verify_sha512(b"tampered", &digest_of(PAYLOAD), "kubo.tar.gz").unwrap_err();
        match err {
            ReconcileError::Integrity { artifact, .. } => assert_eq!(artifact, "kubo.tar.gz"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sidecar_parses_digest_and_rejects_garbage() {
        let digest = digest_of(PAYLOAD);
        let sidecar = format!("{digest}  kubo_v0.29.0_linux-amd64.tar.gz\n");
        assert_eq!(parse_checksum_sidecar(&sidecar).as_deref(), Some(digest.as_str()));

        assert_eq!(parse_checksum_sidecar(""), None);
        assert_eq!(parse_checksum_sidecar("not-a-digest file.tar.gz"), None);
    }
}
