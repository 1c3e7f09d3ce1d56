#![forbid(unsafe_code)]
//! Error types for MeshFS.
//!
//! Defines `MfsError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno mapping used where block errors are stored
//! as raw codes.

use mfs_types::ParseError;
use thiserror::Error;

/// Unified error type for MeshFS operations.
#[derive(Debug, Error)]
pub enum MfsError {
    /// Malformed flags or arguments at an API boundary.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Allocation failure surfaced from an I/O or messaging path.
    #[error("out of memory")]
    NoMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire header or payload violated the message format.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// A peer or handler registration already exists.
    #[error("already exists: {0}")]
    Exists(&'static str),

    /// The peer or subsystem is shutting down and rejects new work.
    #[error("shutting down")]
    ShuttingDown,

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

impl MfsError {
    /// Collapse this error to a negative errno, the representation stored
    /// on blocks and latched for sync waiters.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            Self::Invalid(_) | Self::Parse(_) => -libc::EINVAL,
            Self::NoMemory => -libc::ENOMEM,
            Self::Protocol(_) => -libc::EPROTO,
            Self::NotSupported(_) => -libc::EOPNOTSUPP,
            Self::Exists(_) => -libc::EEXIST,
            Self::ShuttingDown => -libc::ESHUTDOWN,
        }
    }

    /// Rebuild an error from a stored negative errno.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match -errno {
            libc::EINVAL => Self::Invalid("stored error"),
            libc::ENOMEM => Self::NoMemory,
            libc::EPROTO => Self::Protocol("stored protocol error".to_owned()),
            libc::EOPNOTSUPP => Self::NotSupported("stored error"),
            libc::EEXIST => Self::Exists("stored error"),
            libc::ESHUTDOWN => Self::ShuttingDown,
            eno => Self::Io(std::io::Error::from_raw_os_error(eno)),
        }
    }
}

/// Result alias using `MfsError`.
pub type Result<T> = std::result::Result<T, MfsError>;
