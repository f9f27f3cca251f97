//! Error taxonomy shared by the allocator, the matching engine and the
//! completion queue.

use thiserror::Error;

/// Errors returned by `flash-rdm` operations.
///
/// Errors that happen after an operation was accepted are never returned
/// through the posting call; they show up as error records on the CQ.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum Error {
    /// Malformed caller input. Not retryable.
    #[error("invalid argument")]
    InvalidArgument,
    /// Allocator or metadata space exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// Entry pool exhausted. Drive progress and retry.
    #[error("resource temporarily exhausted")]
    ResourceExhausted,
    /// Nothing to do yet: handshake pending, empty CQ, wait timed out.
    #[error("try again")]
    Retry,
    /// Peer lacks a feature the selected protocol requires.
    #[error("operation not supported by peer")]
    Unsupported,
    /// Message longer than the posted buffer.
    #[error("message truncated")]
    Truncated,
    /// Peek found no matching message.
    #[error("no matching message")]
    NoMessage,
    /// Receive was cancelled before it matched.
    #[error("operation cancelled")]
    Cancelled,
    /// The CQ head is an error record; fetch it with `read_err`.
    #[error("error completion available")]
    ErrorAvailable,
    /// Opaque failure reported by the transport collaborator.
    #[error("transport error {0}")]
    Transport(i32),
}

impl Error {
    /// Negative errno-style code, used for `prov_errno` in error records.
    pub const fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => -22,
            Error::OutOfMemory => -12,
            Error::ResourceExhausted => -105,
            Error::Retry => -11,
            Error::Unsupported => -95,
            Error::Truncated => -265,
            Error::NoMessage => -42,
            Error::Cancelled => -125,
            Error::ErrorAvailable => -259,
            Error::Transport(code) => code,
        }
    }

    /// True for conditions the caller should retry after driving progress.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Error::Retry | Error::ResourceExhausted | Error::OutOfMemory
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
