//! Error types for blockimg
//!
//! This module defines the error vocabulary shared by the control plane and
//! its collaborators. Every variant maps onto a negative POSIX error code so
//! callers that speak the C-style contract get the code they expect.

use thiserror::Error;

/// Common result type for blockimg operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason attached to a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Busy,
    NotEmpty,
    InUse,
}

/// Common error type for blockimg
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The lock request completed but ownership could not be confirmed
    #[error("failed to acquire exclusive lock: {0}")]
    LockNotAcquired(String),

    /// The client has been fenced by a peer
    #[error("client is blacklisted: {0}")]
    Blacklisted(String),

    #[error("stale: {0}")]
    Stale(String),

    #[error("unrecognized header format: {0}")]
    Corrupt(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the backing store does not support the requested class method
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Conflict reason, if this error is one of the conflict family
    #[must_use]
    pub fn conflict(&self) -> Option<ConflictKind> {
        match self {
            Self::Busy(_) => Some(ConflictKind::Busy),
            Self::NotEmpty(_) => Some(ConflictKind::NotEmpty),
            Self::InUse(_) => Some(ConflictKind::InUse),
            _ => None,
        }
    }

    /// Negative POSIX error code for the C-style operation contract
    #[must_use]
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Busy(_) => libc::EBUSY,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::InUse(_) => libc::EMLINK,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::OutOfRange(_) => libc::ERANGE,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::LockNotAcquired(_) => libc::EROFS,
            Self::Blacklisted(_) => libc::ESHUTDOWN,
            Self::Stale(_) => libc::ESTALE,
            Self::Corrupt(_) => libc::ENXIO,
            Self::Transport(_) | Self::Internal(_) => libc::EIO,
        };
        -code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::not_found("img").errno(), -libc::ENOENT);
        assert_eq!(Error::busy("locked").errno(), -libc::EBUSY);
        assert_eq!(Error::NotEmpty("snaps".into()).errno(), -libc::ENOTEMPTY);
        assert_eq!(Error::InUse("group".into()).errno(), -libc::EMLINK);
        assert_eq!(Error::LockNotAcquired("x".into()).errno(), -libc::EROFS);
    }

    #[test]
    fn test_conflict_family() {
        assert_eq!(Error::busy("x").conflict(), Some(ConflictKind::Busy));
        assert_eq!(
            Error::NotEmpty("x".into()).conflict(),
            Some(ConflictKind::NotEmpty)
        );
        assert_eq!(Error::not_found("x").conflict(), None);
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::not_found("x").is_not_found());
        assert!(Error::unsupported("x").is_unsupported());
        assert!(!Error::internal("x").is_not_found());
    }
}
