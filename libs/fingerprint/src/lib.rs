//! # imageforge-fingerprint
//!
//! Canonical content-addressed hashing for build requests and their
//! artifacts. Every component of the system that needs to identify a
//! request, a package set, a manifest, or a finished image goes through
//! these functions, so the digest function and truncation lengths are part
//! of the identity contract and must never diverge between callers.
//!
//! All digests are SHA-256, hex-encoded, truncated:
//!
//! - request hash: 12 hex chars over the full request tuple
//! - packages hash: 12 hex chars over the space-joined *sorted* package list
//! - manifest hash: 15 hex chars over the raw manifest file bytes
//! - image hash: 15 hex chars over the space-joined image identity tuple

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Truncation length of a request hash, in hex characters.
pub const REQUEST_HASH_LEN: usize = 12;

/// Truncation length of a packages hash, in hex characters.
pub const PACKAGES_HASH_LEN: usize = 12;

/// Truncation length of a manifest hash, in hex characters.
pub const MANIFEST_HASH_LEN: usize = 15;

/// Truncation length of an image hash, in hex characters.
pub const IMAGE_HASH_LEN: usize = 15;

/// Errors from fingerprint construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    /// A required identity component was empty.
    #[error("invalid input: {0} must not be empty")]
    InvalidInput(&'static str),
}

/// The identity tuple of a build request.
///
/// `network_profile` is the only optional component; an absent overlay is
/// represented by the empty string and still participates in the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity<'a> {
    pub distro: &'a str,
    pub release: &'a str,
    pub target: &'a str,
    pub subtarget: &'a str,
    pub profile: &'a str,
    pub packages_hash: &'a str,
    pub network_profile: &'a str,
}

/// The identity tuple of a built image.
///
/// Differs from [`RequestIdentity`] in that the package set is pinned by
/// the manifest actually installed, not by what was requested: two requests
/// resolving to the same manifest name the same image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentity<'a> {
    pub distro: &'a str,
    pub release: &'a str,
    pub target: &'a str,
    pub subtarget: &'a str,
    pub profile: &'a str,
    pub manifest_hash: &'a str,
    pub network_profile: &'a str,
}

fn digest_hex(input: &[u8], len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let mut out = hex::encode(hasher.finalize());
    out.truncate(len);
    out
}

/// Hash a package list into its canonical 12-char digest.
///
/// The list is sorted before joining so that submission order never
/// produces distinct hashes for the same set.
pub fn packages_hash<S: AsRef<str>>(packages: &[S]) -> String {
    let mut sorted: Vec<&str> = packages.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    digest_hex(sorted.join(" ").as_bytes(), PACKAGES_HASH_LEN)
}

/// Hash a request identity tuple into its canonical 12-char digest.
pub fn request_hash(identity: &RequestIdentity<'_>) -> Result<String, FingerprintError> {
    if identity.distro.is_empty() {
        return Err(FingerprintError::InvalidInput("distro"));
    }
    if identity.release.is_empty() {
        return Err(FingerprintError::InvalidInput("release"));
    }
    if identity.target.is_empty() {
        return Err(FingerprintError::InvalidInput("target"));
    }
    if identity.subtarget.is_empty() {
        return Err(FingerprintError::InvalidInput("subtarget"));
    }
    if identity.profile.is_empty() {
        return Err(FingerprintError::InvalidInput("profile"));
    }

    let joined = [
        identity.distro,
        identity.release,
        identity.target,
        identity.subtarget,
        identity.profile,
        identity.packages_hash,
        identity.network_profile,
    ]
    .join(" ");

    Ok(digest_hex(joined.as_bytes(), REQUEST_HASH_LEN))
}

/// Hash raw manifest file bytes into the canonical 15-char digest.
pub fn manifest_hash(manifest: &[u8]) -> String {
    digest_hex(manifest, MANIFEST_HASH_LEN)
}

/// Hash an image identity tuple into its canonical 15-char digest.
pub fn image_hash(identity: &ImageIdentity<'_>) -> Result<String, FingerprintError> {
    if identity.distro.is_empty() {
        return Err(FingerprintError::InvalidInput("distro"));
    }
    if identity.release.is_empty() {
        return Err(FingerprintError::InvalidInput("release"));
    }
    if identity.target.is_empty() {
        return Err(FingerprintError::InvalidInput("target"));
    }
    if identity.subtarget.is_empty() {
        return Err(FingerprintError::InvalidInput("subtarget"));
    }
    if identity.profile.is_empty() {
        return Err(FingerprintError::InvalidInput("profile"));
    }
    if identity.manifest_hash.is_empty() {
        return Err(FingerprintError::InvalidInput("manifest_hash"));
    }

    let joined = [
        identity.distro,
        identity.release,
        identity.target,
        identity.subtarget,
        identity.profile,
        identity.manifest_hash,
        identity.network_profile,
    ]
    .join(" ");

    Ok(digest_hex(joined.as_bytes(), IMAGE_HASH_LEN))
}
