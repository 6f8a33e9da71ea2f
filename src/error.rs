//! Crate-wide error type.

use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for sorting operations.
///
/// There is no local recovery anywhere in the crate: every failure aborts
/// the sort and surfaces through the driver, which reports it and exits
/// non-zero. The destination file is auto-unlinked on the way out.
#[derive(Debug)]
pub enum Error {
    /// An I/O operation failed. Carries the operation, the path it was
    /// applied to and the underlying OS error.
    Io {
        /// What was being done, e.g. "Reading from".
        op: &'static str,
        /// The file the operation was applied to.
        path: PathBuf,
        /// The underlying OS error.
        source: io::Error,
    },
    /// The input stream violates the record format.
    Malformed(&'static str),
    /// The process environment or the sorter configuration is unusable.
    Config(String),
    /// The memory arena could not be allocated.
    Alloc(usize),
    /// An internal invariant was violated. Reported as "Internal error"
    /// by the driver and never recoverable.
    Internal(String),
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Error {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Error {
        Error::Internal(msg.into())
    }

    /// True for internal invariant violations, which the CLI tags
    /// "Internal error" to tell them apart from runtime failures.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { op, path, source } => write!(f, "{} {}: {}", op, path.display(), source),
            Error::Malformed(msg) => write!(f, "{}", msg),
            Error::Config(msg) => write!(f, "{}", msg),
            Error::Alloc(bytes) => write!(f, "Allocating {} bytes of memory", bytes),
            Error::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
