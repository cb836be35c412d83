//! Error types for cairn_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using cairn_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during cache operations.
///
/// Every variant maps onto a stable string code (see [`Error::code`]) so
/// callers can branch on the failure kind without matching on messages.
#[derive(Error, Debug)]
pub enum Error {
    /// No live index entry exists for the key.
    #[error("No cache entry for key: {key}")]
    EntryNotFound { key: String },

    /// No content file exists for the integrity value.
    #[error("Content not found for integrity: {integrity}")]
    ContentNotFound { integrity: String },

    /// Computed digest does not match the expected one.
    #[error("Integrity check failed: expected {expected}, found {found}")]
    IntegrityMismatch { expected: String, found: String },

    /// Byte count does not match the declared size.
    #[error("Size mismatch: expected {expected} bytes, found {found}")]
    SizeMismatch { expected: u64, found: u64 },

    /// A write produced zero bytes.
    #[error("No data was written")]
    NoData,

    /// Integrity string could not be parsed.
    #[error("Invalid integrity: {reason}")]
    InvalidIntegrity { reason: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// An exclusive lock is held by someone else.
    #[error("Lock at {path} is held by another process")]
    Locked { path: PathBuf },

    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Index entry could not be serialized.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an EntryNotFound error.
    pub fn entry_not_found(key: impl Into<String>) -> Self {
        Error::EntryNotFound { key: key.into() }
    }

    /// Create a ContentNotFound error.
    pub fn content_not_found(integrity: impl ToString) -> Self {
        Error::ContentNotFound {
            integrity: integrity.to_string(),
        }
    }

    /// Create an IntegrityMismatch error.
    pub fn integrity_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Error::IntegrityMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Create a SizeMismatch error.
    pub fn size_mismatch(expected: u64, found: u64) -> Self {
        Error::SizeMismatch { expected, found }
    }

    /// Create an InvalidIntegrity error.
    pub fn invalid_integrity(reason: impl Into<String>) -> Self {
        Error::InvalidIntegrity {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create a Locked error.
    pub fn locked(path: impl Into<PathBuf>) -> Self {
        Error::Locked { path: path.into() }
    }

    /// Returns the errno-style code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::EntryNotFound { .. } | Error::ContentNotFound { .. } => "ENOENT",
            Error::IntegrityMismatch { .. } => "EINTEGRITY",
            Error::SizeMismatch { .. } => "EBADSIZE",
            Error::NoData => "ENODATA",
            Error::InvalidIntegrity { .. } | Error::UnsupportedAlgorithm { .. } => {
                "EBADINTEGRITY"
            }
            Error::Locked { .. } => "ELOCKED",
            Error::Io { .. } => "EIO",
            Error::Json { .. } => "EJSON",
        }
    }

    /// True when the error means "nothing cached here" rather than a fault.
    pub fn is_not_found(&self) -> bool {
        self.code() == "ENOENT"
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        // walkdir::Error can wrap an io::Error or be a loop error
        match err.into_io_error() {
            Some(io_err) => Error::Io { source: io_err },
            None => Error::Io {
                source: std::io::Error::other("filesystem loop while walking cache"),
            },
        }
    }
}
