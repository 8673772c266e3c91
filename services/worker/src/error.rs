//! Worker error types.

use std::time::Duration;

use imageforge_store::StoreError;
use thiserror::Error;

use crate::subprocess::SubprocessError;

/// Errors from imagebuilder provisioning.
///
/// A failed provision leaves the imagebuilder request in the queue so that
/// another worker may retry; no partial catalogue is ever persisted.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No tarball candidate answered with anything but 404.
    #[error("no imagebuilder published for {0}")]
    NotPublished(String),

    #[error("imagebuilder download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Subprocess(#[from] SubprocessError),

    /// `make info` or `make package_list` exited non-zero.
    #[error("{command} failed with non-zero exit")]
    CommandFailed { command: &'static str },

    /// `.config` carried no `CONFIG_TARGET_ARCH_PACKAGES` line.
    #[error("imagebuilder config does not name a package architecture")]
    MissingPackageArch,

    /// `make info` output carried no default package list.
    #[error("imagebuilder info output carried no default packages")]
    MissingDefaultPackages,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Infrastructure errors from a build attempt.
///
/// Domain failures (build_fail, imagesize_fail, signing_fail) are not
/// errors: they transition the request row and persist a log.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("subprocess spawn failed: {0}")]
    Subprocess(SubprocessError),

    /// The build ran past the configured wall-clock budget.
    #[error("build exceeded {0:?} timeout")]
    Timeout(Duration),

    #[error("result archive could not be written: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("result upload failed: {0}")]
    Upload(#[from] reqwest::Error),

    #[error("artifact signing failed: {0}")]
    Sign(#[from] imageforge_signing::SignError),

    #[error(transparent)]
    Fingerprint(#[from] imageforge_fingerprint::FingerprintError),
}

impl From<SubprocessError> for BuildError {
    fn from(err: SubprocessError) -> Self {
        match err {
            SubprocessError::Timeout(t) => Self::Timeout(t),
            other => Self::Subprocess(other),
        }
    }
}
