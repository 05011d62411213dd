//! # Error Types
//!
//! Purpose: One error enum shared by the pool and the channel so callers can
//! react to transport faults uniformly.
//!
//! ## Design Principles
//! 1. **Distinct Conflicts**: `AlreadyExists` is separate from `NoMemory`,
//!    callers retry differently.
//! 2. **Soft vs Hard EOF**: `UnexpectedEof` and `Protocol` are kept apart from
//!    backend `Io` failures.
//! 3. **Fatal Is Not Here**: authoring faults and accounting corruption panic
//!    instead of returning a variant.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type PslResult<T> = Result<T, PslError>;

/// Errors surfaced by the pool and the channel.
#[derive(Debug, Error)]
pub enum PslError {
    /// Allocation failed while growing a table or copying a key.
    #[error("no memory")]
    NoMemory,
    /// The endpoint key is already present in the pool.
    #[error("already exists")]
    AlreadyExists,
    /// The peer closed the stream before the expected data arrived.
    #[error("unexpected end of data")]
    UnexpectedEof,
    /// Framing violation: truncated field, bad length, invalid string.
    #[error("protocol error")]
    Protocol,
    /// Hard failure reported by the I/O backend.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The pool disposer failed to tear a payload down.
    #[error("dispose failed: {0}")]
    Dispose(String),
}

impl PslError {
    /// Returns true when the error means the underlying session is unusable.
    ///
    /// A pooled connection that fails with one of these should be detached
    /// and re-acquired rather than reused.
    pub fn is_connection_error(&self) -> bool {
        match self {
            PslError::UnexpectedEof | PslError::Protocol => true,
            PslError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
            ),
            PslError::NoMemory | PslError::AlreadyExists | PslError::Dispose(_) => false,
        }
    }
}

impl From<std::collections::TryReserveError> for PslError {
    fn from(_: std::collections::TryReserveError) -> Self {
        PslError::NoMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_errors() {
        assert!(PslError::UnexpectedEof.is_connection_error());
        assert!(PslError::Protocol.is_connection_error());
        assert!(PslError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_connection_error());
        assert!(!PslError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_connection_error());
        assert!(!PslError::AlreadyExists.is_connection_error());
        assert!(!PslError::NoMemory.is_connection_error());
    }

    #[test]
    fn try_reserve_maps_to_no_memory() {
        let mut buf: Vec<u8> = Vec::new();
        let err = buf.try_reserve(usize::MAX).unwrap_err();
        assert!(matches!(PslError::from(err), PslError::NoMemory));
    }
}
