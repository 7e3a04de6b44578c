//! Error types for the installer.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, InstallerError>;

/// Error type for installation passes.
///
/// Precondition variants (`ConfigNotReady`, `RegistryNotReady`) mean "try
/// again later" and are never recorded as stage failures; everything else
/// fails the stage that produced it.
#[derive(Debug, thiserror::Error)]
pub enum InstallerError {
    #[error("cluster configuration is not completed")]
    ConfigNotReady,

    #[error("destination image registry is not ready")]
    RegistryNotReady,

    #[error("download error: {0}")]
    Download(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unpack error: {0}")]
    Unpack(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("image engine error: {0}")]
    Engine(String),

    #[error("status write conflict")]
    Conflict,

    #[error("status error: {0}")]
    Status(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl InstallerError {
    /// True for errors that only mean "not yet" — the pass should requeue
    /// without marking any stage failed.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            InstallerError::ConfigNotReady | InstallerError::RegistryNotReady
        )
    }
}
