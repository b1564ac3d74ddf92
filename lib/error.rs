//! The error taxonomy shared by every layer of the stack.

use thiserror::Error;

/// Result alias used by every fallible operation in the crate.
pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced at the VFS boundary.
///
/// Device errors propagate unchanged through the page cache into the inode
/// into the caller; no layer retries or rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FsError {
    /// No such file or directory.
    #[error("no such file or directory")]
    NotFound,

    /// A device or backing-store operation failed.
    #[error("input/output error")]
    Io,

    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The operation is forbidden by the object's mode bits.
    #[error("permission denied")]
    AccessDenied,

    /// The target name already exists.
    #[error("file exists")]
    AlreadyExists,

    /// A directory operation was applied to a non-directory.
    #[error("not a directory")]
    NotADirectory,

    /// A file operation was applied to a directory.
    #[error("is a directory")]
    IsADirectory,

    /// Malformed path, out-of-range offset, or similar caller mistake.
    #[error("invalid argument")]
    InvalidArgument,

    /// The filesystem ran out of blocks or inodes.
    #[error("no space left on device")]
    NoSpace,

    /// A mutation was attempted on a read-only device or mount.
    #[error("read-only file system")]
    ReadOnly,
}

impl FsError {
    /// Translate this error into the host-style errno used by C-shaped shims.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Io => libc::EIO,
            Self::OutOfMemory => libc::ENOMEM,
            Self::AccessDenied => libc::EACCES,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

impl From<std::io::Error> for FsError {
    /// Lossy mapping of host I/O errors into the taxonomy. Anything without
    /// a direct counterpart becomes [`FsError::Io`].
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::AccessDenied,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::InvalidInput => Self::InvalidArgument,
            ErrorKind::OutOfMemory => Self::OutOfMemory,
            ErrorKind::ReadOnlyFilesystem => Self::ReadOnly,
            ErrorKind::StorageFull => Self::NoSpace,
            _ => Self::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_matches_host_conventions() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::IsADirectory.errno(), libc::EISDIR);
    }

    #[test]
    fn host_errors_map_into_taxonomy() {
        let nf = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(FsError::from(nf), FsError::NotFound);

        let other = std::io::Error::other("weird");
        assert_eq!(FsError::from(other), FsError::Io);
    }
}
