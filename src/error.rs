use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Basalt errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The requested key or file does not exist.
    NotFound,
    /// Invalid on-disk data: decoding failures, checksum mismatches, or a
    /// file that disappeared while still referenced by a live version.
    Corruption(String),
    /// An IO error from the filesystem.
    Io(String),
    /// The cache could not allocate space for a value. Callers proceed
    /// without caching; this error never reaches the public API.
    CacheFull,
    /// The engine has been closed. No further operations are accepted.
    Closed,
    /// The operation was canceled through its cancellation token.
    Canceled,
    /// An internal invariant was violated. The engine transitions to a
    /// fatal state and rejects further writes.
    Invariant(String),
    /// A write was attempted on a read-only structure (immutable memtable,
    /// finished batch, read-only engine).
    ReadOnly,
    /// Invalid caller-supplied input, typically options validation.
    InvalidArgument(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::CacheFull => write!(f, "cache full"),
            Error::Closed => write!(f, "engine closed"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::Invariant for the given format string.
#[macro_export]
macro_rules! errinvariant {
    ($($args:tt)*) => { $crate::error::Error::Invariant(format!($($args)*)) };
}

/// A basalt Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            _ => Error::Io(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Invariant(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Closed
    }
}

impl Error {
    /// Whether this error poisons the engine: after a fatal error no
    /// further writes are accepted until restart.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::Invariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Corruption("bad block".into()).is_fatal());
        assert!(Error::Invariant("seq went backwards".into()).is_fatal());
        assert!(!Error::NotFound.is_fatal());
        assert!(!Error::Canceled.is_fatal());
        assert!(!Error::CacheFull.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert_eq!(
            Error::Corruption("crc mismatch".into()).to_string(),
            "corruption: crc mismatch"
        );
    }
}
