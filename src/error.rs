//! Errors for the virtual directory and its collaborators.
//!
//! Remote failures are split by where they happen: metadata and
//! listing calls swallow [`BlobError`]s and return a safe default,
//! while the data-transfer paths (fetching a file into the cache,
//! publishing a closed output, deleting a file) wrap them in
//! [`Error::Fetch`], [`Error::Publish`], and [`Error::Delete`].
//! Local cache I/O is always propagated as [`Error::Cache`].
use std::io::ErrorKind;

/// Result alias for fallible directory operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by a [`crate::BlobStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("object {key} not found")]
    NotFound { key: String },

    #[error("object store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BlobError {
    /// Returns whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            BlobError::NotFound { .. } => true,
            BlobError::Io(e) => crate::benign_error::is_absent_file_error(e),
            BlobError::Backend(_) => false,
        }
    }
}

/// Errors surfaced by [`crate::VirtualDirectory`] and its handles.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("file {name} not found")]
    NotFound { name: String },

    #[error("object {key} not retrievable: {source}")]
    Fetch {
        key: String,
        #[source]
        source: BlobError,
    },

    #[error("failed to publish {key}: {source}")]
    Publish {
        key: String,
        #[source]
        source: BlobError,
    },

    #[error("failed to delete {key}: {source}")]
    Delete {
        key: String,
        #[source]
        source: BlobError,
    },

    #[error("local cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("the option {option:?} cannot be recognized in connection string")]
    Settings { option: String },

    #[error("output already closed")]
    Closed,
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> std::io::Error {
        match error {
            Error::Cache(e) => e,
            Error::NotFound { .. } => std::io::Error::new(ErrorKind::NotFound, error),
            Error::Fetch { ref source, .. } if source.is_not_found() => {
                std::io::Error::new(ErrorKind::NotFound, error)
            }
            Error::InvalidName { .. } | Error::Settings { .. } => {
                std::io::Error::new(ErrorKind::InvalidInput, error)
            }
            other => std::io::Error::new(ErrorKind::Other, other),
        }
    }
}

#[test]
fn test_io_conversion() {
    let err: std::io::Error = Error::NotFound {
        name: "segments.gen".into(),
    }
    .into();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err: std::io::Error = Error::Fetch {
        key: "index/_0.cfs".into(),
        source: BlobError::NotFound {
            key: "index/_0.cfs".into(),
        },
    }
    .into();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err: std::io::Error = Error::InvalidName {
        name: "a/b".into(),
        reason: "contains a path separator",
    }
    .into();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    // Cache errors pass through untouched.
    let err: std::io::Error = Error::Cache(std::io::Error::from(ErrorKind::PermissionDenied)).into();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[test]
fn test_blob_not_found() {
    assert!(BlobError::NotFound { key: "k".into() }.is_not_found());
    assert!(BlobError::Io(std::io::Error::from(ErrorKind::NotFound)).is_not_found());
    assert!(!BlobError::Io(std::io::Error::from(ErrorKind::TimedOut)).is_not_found());
    assert!(!BlobError::Backend("throttled".into()).is_not_found());
}
