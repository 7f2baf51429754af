//! Job identities and configuration fingerprints
//!
//! A job identity ties a persisted record to its input source; a fingerprint
//! captures the parameters a job was started with so drift can be detected
//! when it is resumed.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the identity digest.
const IDENTITY_LEN: usize = 12;

/// Longest identity that is used verbatim as a file stem.
const MAX_STEM_LEN: usize = 64;

/// Errors produced while computing identities or fingerprints
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Identity is empty or whitespace
    #[error("job identity cannot be empty")]
    Empty,

    /// Configuration could not be serialized for fingerprinting
    #[error("cannot fingerprint configuration: {0}")]
    Fingerprint(String),
}

/// Derive a stable job identity from a source name and its size in bytes.
///
/// The same source always maps to the same identity, so a later process can
/// find the checkpoint left behind by an interrupted run.
///
/// # Examples
///
/// ```
/// use resumable_batch::identity::derive_identity;
///
/// let a = derive_identity("talk.srt", 1024);
/// assert_eq!(a.len(), 12);
/// assert_eq!(a, derive_identity("talk.srt", 1024));
/// assert_ne!(a, derive_identity("talk.srt", 2048));
/// ```
pub fn derive_identity(name: &str, size: u64) -> String {
    let digest = sha256_hex(format!("{name}:{size}").as_bytes());
    digest[..IDENTITY_LEN].to_string()
}

/// Fingerprint a configuration value.
///
/// The fingerprint is the SHA-256 of the value's JSON serialization, so two
/// configurations fingerprint equal exactly when they serialize equal.
pub fn fingerprint<T: Serialize + ?Sized>(config: &T) -> Result<String, IdentityError> {
    let bytes =
        serde_json::to_vec(config).map_err(|e| IdentityError::Fingerprint(e.to_string()))?;
    Ok(sha256_hex(&bytes))
}

/// Validate a caller-supplied identity.
pub fn validate_identity(identity: &str) -> Result<(), IdentityError> {
    if identity.trim().is_empty() {
        return Err(IdentityError::Empty);
    }
    Ok(())
}

/// Convert an identity to a filesystem-safe file stem.
///
/// Identities made only of ASCII alphanumerics, `-` and `_` are used as-is.
/// Anything else is replaced by `_` and suffixed with a short digest of the
/// original identity so distinct identities never share a stem.
///
/// # Examples
///
/// ```
/// use resumable_batch::identity::storage_stem;
///
/// assert_eq!(storage_stem("a1b2c3d4e5f6"), "a1b2c3d4e5f6");
/// assert!(storage_stem("my talk.srt").starts_with("my_talk_srt-"));
/// assert_ne!(storage_stem("a:b"), storage_stem("a/b"));
/// ```
pub fn storage_stem(identity: &str) -> String {
    let safe: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe == identity && !safe.is_empty() && safe.len() <= MAX_STEM_LEN {
        return safe;
    }

    let prefix: String = safe.chars().take(MAX_STEM_LEN / 2).collect();
    let digest = sha256_hex(identity.as_bytes());
    format!("{prefix}-{}", &digest[..IDENTITY_LEN])
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
