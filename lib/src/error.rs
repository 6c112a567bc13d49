//! The error surface of staging operations.
//!
//! Each failure category gets its own variant so the binary can map errors
//! to distinct exit codes for scripting. Unexpected runtime detail rides in
//! [`anyhow::Error`] sources, keeping the `.context()` chains intact when
//! the binary renders the error with `{:#}`.

use std::process::ExitStatus;

use crate::reference::ImageReference;

/// An error from the staging workflow, tagged with the step that produced it.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum StageError {
    /// The provided image reference could not be parsed.
    #[error("invalid image reference {input:?}: {reason}")]
    InvalidReference { input: String, reason: String },
    /// The process lacks root privileges.
    #[error("this command must be run as root")]
    Permission,
    /// The image is already staged and `--force` was not given.
    #[error("image {reference} already exists on stage, use --force to overwrite")]
    AlreadyStaged { reference: ImageReference },
    /// Resolving or materializing the image from the content store failed.
    #[error("extracting {reference}")]
    Extraction {
        reference: ImageReference,
        #[source]
        source: anyhow::Error,
    },
    /// Publishing the extracted tree into the staging index failed.
    #[error("publishing {reference}")]
    Publish {
        reference: ImageReference,
        #[source]
        source: anyhow::Error,
    },
    /// A post-stage hook exited unsuccessfully. The staged entry is
    /// unaffected; re-run the hooks with `bootstage run-hooks`.
    #[error("hook {hook} failed: {status}")]
    Hook {
        hook: String,
        status: ExitStatus,
        output: String,
    },
    /// Regenerating the bootloader configuration failed. The staged entry
    /// is unaffected; re-run with `bootstage sync-bootloader`.
    #[error("synchronizing bootloader configuration")]
    BootloaderSync {
        #[source]
        source: anyhow::Error,
    },
    /// Any other runtime failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// The process exit code for this error; stable per category so that
    /// scripts can distinguish e.g. "already staged" from a hook failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::InvalidReference { .. } => 2,
            StageError::Permission => 3,
            StageError::AlreadyStaged { .. } => 4,
            StageError::Extraction { .. } => 5,
            StageError::Publish { .. } => 6,
            StageError::Hook { .. } => 7,
            StageError::BootloaderSync { .. } => 8,
            StageError::Other(_) => 1,
        }
    }
}

/// The Result type used throughout the workflow surface.
pub type Result<T, E = StageError> = std::result::Result<T, E>;
