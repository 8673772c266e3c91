//! Detached Ed25519 signatures in the usign container format.
//!
//! Workers sign the artifact archives they upload; the server verifies the
//! signature against the public key recorded at worker registration. Both
//! sides speak usign's two-line text files:
//!
//! ```text
//! untrusted comment: <free text>
//! <base64 blob>
//! ```
//!
//! The blob starts with the two-byte algorithm tag `Ed`, followed by an
//! 8-byte key fingerprint, followed by the raw key or signature bytes
//! (32 for public keys, 64 for signatures). The fingerprint lets a verifier
//! reject a signature made with a different key before doing any curve
//! math.
//!
//! Secret key files use the same container with 32 bytes of seed material;
//! they are stored unencrypted and rely on filesystem permissions.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use thiserror::Error;

/// Two-byte algorithm tag shared by all blobs.
const PKALG: &[u8; 2] = b"Ed";

/// Length of the key fingerprint embedded in every blob.
const KEYNUM_LEN: usize = 8;

/// Comment line prefix required by the container format.
const COMMENT_PREFIX: &str = "untrusted comment:";

/// Signing and verification errors.
#[derive(Debug, Error)]
pub enum SignError {
    /// The two-line container could not be parsed.
    #[error("malformed key or signature file: {0}")]
    Malformed(&'static str),

    /// The blob's algorithm tag was not `Ed`.
    #[error("unsupported signature algorithm")]
    UnsupportedAlgorithm,

    /// Signature was made with a different key.
    #[error("key fingerprint mismatch")]
    KeyMismatch,

    /// The signature did not verify against the public key.
    #[error("signature verification failed")]
    BadSignature,

    /// The embedded key bytes were not a valid Ed25519 key.
    #[error("invalid key material")]
    InvalidKey,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An Ed25519 keypair with its usign key fingerprint.
pub struct Keypair {
    signing: SigningKey,
    keynum: [u8; KEYNUM_LEN],
}

impl Keypair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut seed = [0u8; 32];
        rng.fill(&mut seed[..]);
        let mut keynum = [0u8; KEYNUM_LEN];
        rng.fill(&mut keynum[..]);
        Self::from_seed(seed, keynum)
    }

    /// Build a keypair from explicit seed material.
    pub fn from_seed(seed: [u8; 32], keynum: [u8; KEYNUM_LEN]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
            keynum,
        }
    }

    /// The public half in usign text form.
    pub fn public_key(&self) -> String {
        let mut blob = Vec::with_capacity(2 + KEYNUM_LEN + 32);
        blob.extend_from_slice(PKALG);
        blob.extend_from_slice(&self.keynum);
        blob.extend_from_slice(self.signing.verifying_key().as_bytes());
        encode_container("public key", &blob)
    }

    /// Sign a message, returning the signature in usign text form.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature = self.signing.sign(message);
        let mut blob = Vec::with_capacity(2 + KEYNUM_LEN + 64);
        blob.extend_from_slice(PKALG);
        blob.extend_from_slice(&self.keynum);
        blob.extend_from_slice(&signature.to_bytes());
        encode_container("signature", &blob)
    }

    /// Sign the file at `path`, writing the signature next to it as
    /// `<path>.sig`.
    pub fn sign_file(&self, path: &Path) -> Result<(), SignError> {
        let data = fs::read(path)?;
        let signature = self.sign(&data);
        let mut sig_path = path.as_os_str().to_owned();
        sig_path.push(".sig");
        fs::write(sig_path, signature)?;
        Ok(())
    }

    /// Serialise the secret half in usign text form.
    pub fn secret_key(&self) -> String {
        let mut blob = Vec::with_capacity(2 + KEYNUM_LEN + 32);
        blob.extend_from_slice(PKALG);
        blob.extend_from_slice(&self.keynum);
        blob.extend_from_slice(&self.signing.to_bytes());
        encode_container("secret key", &blob)
    }

    /// Load a keypair from a secret key file written by [`Keypair::save`].
    pub fn load(path: &Path) -> Result<Self, SignError> {
        let contents = fs::read_to_string(path)?;
        let blob = decode_container(&contents)?;
        let (keynum, seed) = split_blob::<32>(&blob)?;
        Ok(Self::from_seed(seed, keynum))
    }

    /// Persist the secret key file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), SignError> {
        fs::write(path, self.secret_key())?;
        Ok(())
    }
}

/// Verify `message` against a usign signature and public key, both in text
/// form.
pub fn verify(message: &[u8], signature: &str, public_key: &str) -> Result<(), SignError> {
    let sig_blob = decode_container(signature)?;
    let key_blob = decode_container(public_key)?;

    let (sig_keynum, sig_bytes) = split_blob::<64>(&sig_blob)?;
    let (key_keynum, key_bytes) = split_blob::<32>(&key_blob)?;

    if sig_keynum != key_keynum {
        return Err(SignError::KeyMismatch);
    }

    let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignError::InvalidKey)?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying
        .verify(message, &signature)
        .map_err(|_| SignError::BadSignature)
}

/// Verify the file at `data_path` against a detached signature file.
pub fn verify_file(
    data_path: &Path,
    signature_path: &Path,
    public_key: &str,
) -> Result<(), SignError> {
    let data = fs::read(data_path)?;
    let signature = fs::read_to_string(signature_path)?;
    verify(&data, &signature, public_key)
}

fn encode_container(kind: &str, blob: &[u8]) -> String {
    format!(
        "{COMMENT_PREFIX} imageforge {kind}\n{}\n",
        BASE64.encode(blob)
    )
}

fn decode_container(contents: &str) -> Result<Vec<u8>, SignError> {
    let mut lines = contents.lines();
    let comment = lines
        .next()
        .ok_or(SignError::Malformed("missing comment line"))?;
    if !comment.starts_with(COMMENT_PREFIX) {
        return Err(SignError::Malformed("missing untrusted comment"));
    }
    let blob_line = lines.next().ok_or(SignError::Malformed("missing blob"))?;
    BASE64
        .decode(blob_line.trim())
        .map_err(|_| SignError::Malformed("blob is not valid base64"))
}

fn split_blob<const N: usize>(blob: &[u8]) -> Result<([u8; KEYNUM_LEN], [u8; N]), SignError> {
    if blob.len() != 2 + KEYNUM_LEN + N {
        return Err(SignError::Malformed("blob has wrong length"));
    }
    if &blob[..2] != PKALG {
        return Err(SignError::UnsupportedAlgorithm);
    }
    let mut keynum = [0u8; KEYNUM_LEN];
    keynum.copy_from_slice(&blob[2..2 + KEYNUM_LEN]);
    let mut payload = [0u8; N];
    payload.copy_from_slice(&blob[2 + KEYNUM_LEN..]);
    Ok((keynum, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_keypair(tag: u8) -> Keypair {
        Keypair::from_seed([tag; 32], [tag; 8])
    }

    #[test]
    fn sign_verify_round_trip() {
        let keypair = fixed_keypair(1);
        let message = b"firmware archive bytes";
        let signature = keypair.sign(message);
        verify(message, &signature, &keypair.public_key()).unwrap();
    }

    #[test]
    fn verify_rejects_other_key() {
        let signer = fixed_keypair(1);
        let other = fixed_keypair(2);
        let signature = signer.sign(b"data");
        let err = verify(b"data", &signature, &other.public_key()).unwrap_err();
        assert!(matches!(err, SignError::KeyMismatch));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = fixed_keypair(3);
        let signature = keypair.sign(b"original");
        let err = verify(b"tampered", &signature, &keypair.public_key()).unwrap_err();
        assert!(matches!(err, SignError::BadSignature));
    }

    #[test]
    fn same_keynum_different_key_fails_signature_check() {
        let signer = Keypair::from_seed([4; 32], [9; 8]);
        let impostor = Keypair::from_seed([5; 32], [9; 8]);
        let signature = signer.sign(b"data");
        let err = verify(b"data", &signature, &impostor.public_key()).unwrap_err();
        assert!(matches!(err, SignError::BadSignature));
    }

    #[test]
    fn container_format_is_two_lines() {
        let keypair = fixed_keypair(6);
        let text = keypair.public_key();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("untrusted comment:"));
    }

    #[test]
    fn malformed_containers_are_rejected() {
        let keypair = fixed_keypair(7);
        let signature = keypair.sign(b"data");
        assert!(matches!(
            verify(b"data", "not a container", &keypair.public_key()),
            Err(SignError::Malformed(_))
        ));
        assert!(matches!(
            verify(b"data", &signature, "untrusted comment: x\nAAAA\n"),
            Err(SignError::Malformed(_))
        ));
    }

    #[test]
    fn keypair_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("worker.sec");
        let keypair = fixed_keypair(8);
        keypair.save(&key_path).unwrap();
        let loaded = Keypair::load(&key_path).unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());

        let signature = loaded.sign(b"data");
        verify(b"data", &signature, &keypair.public_key()).unwrap();
    }

    #[test]
    fn sign_file_writes_sig_next_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("abc123.zip");
        std::fs::write(&data_path, b"archive").unwrap();

        let keypair = fixed_keypair(9);
        keypair.sign_file(&data_path).unwrap();

        let sig_path = dir.path().join("abc123.zip.sig");
        verify_file(&data_path, &sig_path, &keypair.public_key()).unwrap();
    }
}
