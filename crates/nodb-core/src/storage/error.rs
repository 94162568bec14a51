//! Error handling
//!
//! Every failure the store can report, with descriptive messages and
//! recovery suggestions where the caller can do something about it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while opening, navigating, or persisting a document
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration names an option that does not exist
    #[error("Unknown option '{name}' (expected one of: create, unsafe, manual, force)")]
    UnknownOption { name: String },

    /// Configuration gives a recognized option a non-boolean value
    #[error("Option '{name}' must be a boolean, got {value}")]
    InvalidOptionValue { name: String, value: String },

    /// Configuration text could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Storage or document was used after it was closed
    #[error("'{path}' is closed")]
    UseAfterClose { path: PathBuf },

    /// Navigation to a key that does not exist
    #[error("Key not found: '{path}'")]
    KeyNotFound { path: String },

    /// Navigation through a view whose subtree was replaced or deleted
    #[error("Stale view: '{path}' was replaced or removed after this view was created")]
    StaleView { path: String },

    /// Navigation into a value that is not a mapping
    #[error("'{path}' is not a mapping")]
    NotAMapping { path: String },

    /// Direct mutation of a document's top-level bindings
    #[error("Top-level binding '{key}' cannot be altered directly; mutate it through a node")]
    ImmutableRoot { key: String },

    /// Destroy attempted on a document that still holds data
    #[error("Refusing to destroy '{path}': document is not empty")]
    NotEmpty { path: PathBuf },

    /// A dirty document was abandoned without flush or close
    #[error("Unsaved changes to '{path}' were discarded")]
    UnsavedDataDiscarded { path: PathBuf },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File not found (when expected to exist)
    #[error("File not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure on a path
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File content is not valid JSON
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// File content is valid JSON but not a document
    #[error("Invalid document format in '{path}': {details}")]
    InvalidFormat { path: PathBuf, details: String },
}

impl Error {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => Error::NotFound { path },
            _ if is_disk_full_error(&error) => Error::DiskFull {
                path,
                source: error,
            },
            _ => Error::Io {
                path,
                source: error,
            },
        }
    }

    /// Check if this error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound { .. }
                | Error::NotEmpty { .. }
                | Error::DiskFull { .. }
                | Error::PermissionDenied { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::KeyNotFound { .. } => {
                Some("Supply a default with get_or_insert, or check contains_key first.")
            }
            Error::NotEmpty { .. } => {
                Some("Empty the document first, or destroy it with the force option.")
            }
            Error::DiskFull { .. } => Some("Free up disk space and try again."),
            Error::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            Error::NotFound { .. } => Some("Open the document with the create option."),
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::from_io(io_err, PathBuf::from("/test/path.json"));

        assert!(matches!(err, Error::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_not_found_classification() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = Error::from_io(io_err, PathBuf::from("/missing/file.json"));

        assert!(matches!(err, Error::NotFound { .. }));
        assert!(err.recovery_suggestion().unwrap().contains("create"));
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = Error::from_io(io_err, PathBuf::from("/full/disk.json"));

        assert!(matches!(err, Error::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_io_falls_through() {
        let io_err = io::Error::new(io::ErrorKind::Other, "something odd");
        let err = Error::from_io(io_err, PathBuf::from("/odd.json"));

        assert!(matches!(err, Error::Io { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_stale_view_is_not_recoverable() {
        let err = Error::StaleView {
            path: "a.b.c".to_string(),
        };

        assert!(!err.is_recoverable());
        assert!(err.recovery_suggestion().is_none());
        assert!(err.to_string().contains("a.b.c"));
    }

    #[test]
    fn test_not_empty_display() {
        let err = Error::NotEmpty {
            path: PathBuf::from("/data/test.json"),
        };

        let msg = err.to_string();
        assert!(msg.contains("not empty"));
        assert!(msg.contains("/data/test.json"));
        assert!(err.is_recoverable());
    }
}
