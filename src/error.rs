//! Error types for halfdisk operations
//!
//! Every fallible operation in the crate returns [`Result`]. Errors fall into
//! a small taxonomy: argument and session-misuse errors are raised
//! synchronously without touching state, format and corruption errors are
//! fatal for the open/decode in progress, and I/O errors raised inside the
//! flush pipeline surface through [`Error::Flush`].

use std::io;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by halfdisk operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller supplied an invalid argument (for example an empty key).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An existing store directory has no metadata file.
    #[error("cannot load existing store from {0}: metadata file is missing")]
    MissingMetadata(PathBuf),

    /// A persisted file has an unexpected format version or magic.
    #[error("incompatible {what} format: found {found}, expected {expected}")]
    IncompatibleFormat {
        /// Which file or structure was being read.
        what: &'static str,
        /// Version found on disk.
        found: i64,
        /// Version this build understands.
        expected: i64,
    },

    /// Persisted data is corrupt and cannot be decoded safely.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The first failure observed while flushing a write session.
    #[error("flush failed at bucket {bucket_index}: {source}")]
    Flush {
        /// Bucket whose read, update or store step failed.
        bucket_index: u32,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for [`Error::InvalidState`].
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Shorthand for [`Error::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Check if this error reports corrupt persisted data, directly or as a
    /// flush failure cause.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Corruption(_) => true,
            Error::Flush { source, .. } => source.is_corruption(),
            _ => false,
        }
    }

    /// Check if this error reports session misuse.
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    /// Check if this error reports an invalid argument.
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}
