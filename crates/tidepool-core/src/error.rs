//! Error types for Tidepool store operations
//!
//! Every store-level failure is a `StoreError`. Variants carry the file
//! path and byte offset where that makes sense, so callers can log them
//! without extra context.

use std::path::PathBuf;

use thiserror::Error;

/// Store error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed on an open store
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Store could not be opened or created
    #[error("cannot open store {}: {reason}", .path.display())]
    Open {
        /// Path that was being opened
        path: PathBuf,
        /// I/O error kind, when the failure came from the filesystem
        kind: Option<std::io::ErrorKind>,
        /// Why the open failed
        reason: String,
    },

    /// Store file structure is damaged beyond the record being read
    #[error("store corrupted in {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        /// Corrupted store file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error(
        "magic bytes not found in {} at offset {offset}: found {}",
        .path.display(), hex4(.found_bytes)
    )]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Entry size exceeds maximum allowed
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// Key is not present in the store
    #[error("key not found: {key}")]
    KeyNotFound {
        /// The key that was looked up
        key: String,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

fn hex4(bytes: &[u8; 4]) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

impl StoreError {
    /// Wrap an I/O error with the file it happened on.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for a missing key, the one "error" read paths routinely expect.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::ChecksumMismatch {
            path: PathBuf::from("/tmp/test.tide"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();

        match store_err {
            StoreError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_display_with_and_without_path() {
        let with_path = StoreError::io(
            "/data/a.tide",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
            "write failed",
        );
        assert!(with_path.to_string().contains("in /data/a.tide"));

        let bare: StoreError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(bare.to_string().starts_with("I/O error: boom"));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(StoreError::KeyNotFound { key: "k".into() }.is_not_found());
        assert!(!StoreError::Open {
            path: PathBuf::from("x"),
            kind: None,
            reason: "bad header".into(),
        }
        .is_not_found());
    }
}
