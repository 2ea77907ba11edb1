use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::vcs::VcsError;

/// Errors that can occur in filesystem operations
#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// A mutation was attempted through a historical view
    #[error("Permission denied for path: {0}")]
    PermissionDenied(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("File handle {0} is not open")]
    BadHandle(u64),

    #[error("Version control error: {0}")]
    Vcs(#[from] VcsError),
}

impl From<nix::Error> for FsError {
    fn from(e: nix::Error) -> Self {
        FsError::Io(io::Error::from(e))
    }
}

/// Extension trait for converting io::Error into more specific FsError types
pub trait IoErrorExt {
    /// Convert an io::Error into a more specific FsError based on the error kind and path
    fn into_fs_error(self, path: impl AsRef<Path>) -> FsError;
}

impl IoErrorExt for io::Error {
    fn into_fs_error(self, path: impl AsRef<Path>) -> FsError {
        match self.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.as_ref().to_path_buf()),
            _ => FsError::Io(self),
        }
    }
}

/// Extension trait to convert FsError to i32 error codes for FUSE
pub trait FsErrorCode {
    /// Convert to a libc error code for FUSE replies
    fn to_error_code(&self) -> i32;
}

impl FsErrorCode for FsError {
    fn to_error_code(&self) -> i32 {
        use libc::*;

        match self {
            FsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            FsError::NotFound(_) => ENOENT,
            FsError::PermissionDenied(_) => EACCES,
            FsError::InvalidPath(_) => EINVAL,
            FsError::BadHandle(_) => EBADF,
            FsError::Vcs(VcsError::NoRevision(_)) => ENOENT,
            FsError::Vcs(_) => EIO,
        }
    }
}

/// Result type for filesystem operations
pub type FsResult<T> = Result<T, FsError>;
