// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for MemFs Core

use libc::c_int;

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// Injected by the fault policy; the caller is expected to retry.
    #[error("stale file handle")]
    TransientStale,
    #[error("not supported")]
    NotSupported,
    #[error("invalid argument")]
    InvalidArgument,
}

impl FsError {
    /// POSIX errno a transport reports for this error.
    pub fn errno(self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
            FsError::TransientStale => libc::ESTALE,
            FsError::NotSupported => libc::ENOSYS,
            FsError::InvalidArgument => libc::EINVAL,
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(self, FsError::TransientStale)
    }
}

pub type FsResult<T> = Result<T, FsError>;
