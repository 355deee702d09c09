use thiserror::Error;

pub type TransFsResult<T> = Result<T, TransFsError>;

/// Error taxonomy for the core. Variants map to POSIX errnos at the FUSE
/// boundary via [`TransFsError::errno`].
#[derive(Debug, Error)]
pub enum TransFsError {
    /// Virtual or physical path has no resolution. A normal negative result,
    /// not a failure.
    #[error("not found")]
    NotFound,

    /// Write operation against the read-only mount.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Physical stat/open refused by the OS.
    #[error("permission denied")]
    PermissionDenied,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive indexing or extraction failed.
    #[error("malformed archive {archive}: {reason}")]
    MalformedArchive { archive: String, reason: String },

    /// Startup only; never reaches the kernel.
    #[error("config error: {0}")]
    Config(String),
}

impl TransFsError {
    /// The POSIX errno surfaced to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            TransFsError::NotFound => libc::ENOENT,
            TransFsError::ReadOnly => libc::EROFS,
            TransFsError::PermissionDenied => libc::EACCES,
            TransFsError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => libc::ENOENT,
                std::io::ErrorKind::PermissionDenied => libc::EACCES,
                _ => e.raw_os_error().unwrap_or(libc::EIO),
            },
            TransFsError::MalformedArchive { .. } => libc::EIO,
            TransFsError::Config(_) => libc::EIO,
        }
    }

    pub fn malformed_archive(archive: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        TransFsError::MalformedArchive {
            archive: archive.into(),
            reason: reason.to_string(),
        }
    }

    /// Recover an owned error from one shared across single-flight waiters.
    pub fn from_shared(shared: std::sync::Arc<TransFsError>) -> TransFsError {
        match std::sync::Arc::try_unwrap(shared) {
            Ok(e) => e,
            Err(shared) => match &*shared {
                TransFsError::NotFound => TransFsError::NotFound,
                TransFsError::ReadOnly => TransFsError::ReadOnly,
                TransFsError::PermissionDenied => TransFsError::PermissionDenied,
                TransFsError::MalformedArchive { archive, reason } => {
                    TransFsError::MalformedArchive {
                        archive: archive.clone(),
                        reason: reason.clone(),
                    }
                }
                TransFsError::Config(msg) => TransFsError::Config(msg.clone()),
                TransFsError::Io(e) => {
                    TransFsError::Io(std::io::Error::new(e.kind(), e.to_string()))
                }
            },
        }
    }

    /// Classify a stat/open failure: a missing path is a normal negative
    /// result, everything else stays an I/O error.
    pub fn from_stat(e: std::io::Error) -> TransFsError {
        match e.kind() {
            std::io::ErrorKind::NotFound => TransFsError::NotFound,
            std::io::ErrorKind::PermissionDenied => TransFsError::PermissionDenied,
            _ => TransFsError::Io(e),
        }
    }
}
