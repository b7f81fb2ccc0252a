//! Error taxonomy and errno mapping.
//!
//! Every failure in the namespace client, the mirror and the mutation
//! synchronizer is a [`NamespaceError`]. The adapter surfaces them unchanged;
//! the kernel-facing layer turns them into errno values through
//! [`NamespaceError::to_errno`], going through an [`ErrorCategory`] so the
//! classification can be tested separately from the platform constants.

use std::time::Duration;

use thiserror::Error;
use tonic::Code;

/// errno for a failed remote operation.
///
/// `EREMOTEIO` only exists on Linux; other platforms fall back to `EIO`.
#[cfg(target_os = "linux")]
pub const REMOTE_IO_ERRNO: i32 = libc::EREMOTEIO;

/// errno for a failed remote operation.
#[cfg(not(target_os = "linux"))]
pub const REMOTE_IO_ERRNO: i32 = libc::EIO;

/// Errors produced by the namespace client and the adapter layer.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// The node does not exist (remotely or in the mirror).
    #[error("node not found: {0}")]
    NotFound(String),

    /// A create conflicted with an existing node.
    #[error("node already exists: {0}")]
    AlreadyExists(String),

    /// Connection or session failure, after retries where applicable.
    #[error("remote namespace unavailable: {0}")]
    Unavailable(String),

    /// A mutation was issued but its notification never arrived in time.
    ///
    /// The remote call may have been applied. The same ambiguity applies to
    /// a create or delete retried after a transport error: if the first
    /// attempt landed, the retry reports `AlreadyExists` or `NotFound`.
    #[error("timed out after {after:?} waiting for {path} to become visible")]
    Timeout { path: String, after: Duration },

    /// The notification stream disagrees with the mirror.
    #[error("notification stream desynchronized: {0}")]
    Corrupted(String),

    /// The remote service refused the request for another reason.
    #[error("remote namespace rejected the request: {0}")]
    Rejected(String),

    /// The path cannot be represented in the namespace.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl NamespaceError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, NamespaceError::Unavailable(_))
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }

    /// Converts this error to a libc error code for the kernel.
    pub fn to_errno(&self) -> i32 {
        self.category().to_errno()
    }
}

impl From<etcd_client::Error> for NamespaceError {
    fn from(e: etcd_client::Error) -> Self {
        match &e {
            etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
                NamespaceError::Unavailable(e.to_string())
            }
            etcd_client::Error::GRpcStatus(status) => match status.code() {
                Code::Unavailable | Code::DeadlineExceeded | Code::Aborted | Code::Unknown => {
                    NamespaceError::Unavailable(e.to_string())
                }
                _ => NamespaceError::Rejected(e.to_string()),
            },
            _ => NamespaceError::Rejected(e.to_string()),
        }
    }
}

/// Semantic category of a [`NamespaceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// ENOENT
    NotFound,
    /// EEXIST
    AlreadyExists,
    /// EINVAL
    InvalidArgument,
    /// EREMOTEIO (EIO where unavailable)
    RemoteIo,
}

impl ErrorCategory {
    /// Converts this category to a POSIX errno value.
    #[inline]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::InvalidArgument => libc::EINVAL,
            Self::RemoteIo => REMOTE_IO_ERRNO,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::InvalidArgument => "InvalidArgument",
            Self::RemoteIo => "RemoteIo",
        }
    }
}

impl From<&NamespaceError> for ErrorCategory {
    fn from(e: &NamespaceError) -> Self {
        match e {
            NamespaceError::NotFound(_) => Self::NotFound,
            NamespaceError::AlreadyExists(_) => Self::AlreadyExists,
            NamespaceError::InvalidPath(_) => Self::InvalidArgument,
            NamespaceError::Unavailable(_)
            | NamespaceError::Timeout { .. }
            | NamespaceError::Corrupted(_)
            | NamespaceError::Rejected(_) => Self::RemoteIo,
        }
    }
}

/// Result type for namespace and adapter operations.
pub type NamespaceResult<T> = Result<T, NamespaceError>;
