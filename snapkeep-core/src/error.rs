/*!
Error types for the snapkeep core engine.
*/

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout snapkeep core.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors that can occur during snapshot operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// A file the operation depends on does not exist
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    /// Copy, delete, read or directory-creation failure
    #[error("I/O error while {operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settings store failures
    #[error("Settings error: {0}")]
    Settings(String),

    /// Metadata repository failures
    #[error("Repository error: {0}")]
    Repository(String),

    /// No metadata record exists for the requested id
    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(String),

    /// Snapshot file content no longer matches its recorded hash
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background worker lifecycle failures
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Coarse classification used for log fields and caller-side messaging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    IoFailure,
    ConfigError,
    Repository,
    Integrity,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::Repository => "repository",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl SnapshotError {
    /// Create a new not-found error for a missing file
    pub fn not_found<P: AsRef<Path>>(what: &'static str, path: P) -> Self {
        Self::NotFound {
            what,
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create a new I/O error annotated with the operation and path
    pub fn io<P: AsRef<Path>>(operation: &'static str, path: P, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a new repository error
    pub fn repository<S: Into<String>>(msg: S) -> Self {
        Self::Repository(msg.into())
    }

    /// Create a new settings error
    pub fn settings<S: Into<String>>(msg: S) -> Self {
        Self::Settings(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Classify the error into the taxonomy reported to logs and callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::NotFound { .. } | SnapshotError::UnknownSnapshot(_) => {
                ErrorKind::NotFound
            }
            SnapshotError::Io { .. } => ErrorKind::IoFailure,
            SnapshotError::Config(_) | SnapshotError::Settings(_) => ErrorKind::ConfigError,
            SnapshotError::Repository(_) | SnapshotError::Json(_) => ErrorKind::Repository,
            SnapshotError::IntegrityCheckFailed { .. } => ErrorKind::Integrity,
            SnapshotError::Scheduler(_) => ErrorKind::Internal,
        }
    }
}
