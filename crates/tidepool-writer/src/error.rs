//! Error types for writer and registry operations

use thiserror::Error;
use tidepool_core::StoreError;

/// Writer error types
#[derive(Debug, Clone, Error)]
pub enum WriterError {
    /// Error from the underlying store, passed through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Compaction failed; the store is untouched and its writer still usable
    #[error("compaction of {name} failed: {source}")]
    Compaction {
        name: String,
        #[source]
        source: StoreError,
    },

    /// Writer is already terminating, or no writer is open for the name
    #[error("writer for {name} is already closed")]
    AlreadyClosed { name: String },

    /// Store name does not map to a path inside the root
    #[error("invalid store name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Configuration rejected by `Config::validate`
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Writer thread or runtime could not be started
    #[error("failed to start writer for {name}: {message}")]
    Spawn { name: String, message: String },
}

impl WriterError {
    /// True when the store (not the key) could not be opened.
    pub fn is_open_error(&self) -> bool {
        matches!(self, WriterError::Store(StoreError::Open { .. }))
    }

    /// True for a missing key on the read path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WriterError::Store(e) if e.is_not_found())
    }
}

/// Result type alias for writer operations
pub type WriterResult<T> = Result<T, WriterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_store_errors_pass_through() {
        let err: WriterError = StoreError::KeyNotFound { key: "2024-01-01T00:00:00Z".into() }.into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "key not found: 2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_open_predicate() {
        let err: WriterError = StoreError::Open {
            path: PathBuf::from("/db/x.tide"),
            kind: Some(std::io::ErrorKind::NotFound),
            reason: "No such file or directory".into(),
        }
        .into();
        assert!(err.is_open_error());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_compaction_display_names_store() {
        let err = WriterError::Compaction {
            name: "metrics".into(),
            source: StoreError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: "disk full".into(),
            },
        };
        let display = err.to_string();
        assert!(display.contains("compaction of metrics failed"));
        assert!(display.contains("disk full"));
    }
}
