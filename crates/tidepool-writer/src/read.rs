//! Read path: point lookups and range scans on transient handles.
//!
//! Reads never go through a writer. Each call opens its own handle,
//! uses it, and closes it before returning, so a read sees only what
//! writers have committed.

use std::ops::ControlFlow;
use std::path::Path;

use tidepool_core::StoreResult;
use tracing::warn;

use crate::backend::{Backend, StoreHandle};
use crate::error::{WriterError, WriterResult};

fn open<B: Backend>(backend: &B, path: &Path) -> WriterResult<B::Handle> {
    backend.open(path, false).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Error opening store for read");
        WriterError::from(e)
    })
}

fn release<H: StoreHandle>(handle: H, path: &Path) {
    if let Err(e) = handle.close() {
        warn!(path = %path.display(), error = %e, "Error closing read handle");
    }
}

/// True once `key` has reached the exclusive upper bound `to`.
fn past_end(key: &str, to: &str) -> bool {
    !to.is_empty() && key >= to
}

pub(crate) fn get<B: Backend>(backend: &B, path: &Path, key: &str) -> WriterResult<Vec<u8>> {
    let handle = open(backend, path)?;
    let value = handle.get(key);
    release(handle, path);
    Ok(value?)
}

/// Visit entries with `from <= key < to`.
///
/// A visitor error stops the scan and is returned in preference to any
/// store error.
pub(crate) fn scan_range<B, F, E>(backend: &B, path: &Path, from: &str, to: &str, mut visit: F) -> Result<(), E>
where
    B: Backend,
    F: FnMut(&str, &[u8]) -> Result<(), E>,
    E: From<WriterError>,
{
    let handle = open(backend, path)?;
    let mut visitor_error = None;

    let walked = handle.walk(from, &mut |key: &str, value: &[u8]| -> StoreResult<ControlFlow<()>> {
        if past_end(key, to) {
            return Ok(ControlFlow::Break(()));
        }
        match visit(key, value) {
            Ok(()) => Ok(ControlFlow::Continue(())),
            Err(e) => {
                visitor_error = Some(e);
                Ok(ControlFlow::Break(()))
            }
        }
    });
    release(handle, path);

    if let Some(e) = visitor_error {
        return Err(e);
    }
    walked.map_err(|e| E::from(WriterError::from(e)))
}

/// Visit keys with `from <= key < to` without reading values.
pub(crate) fn scan_keys<B, F, E>(backend: &B, path: &Path, from: &str, to: &str, mut visit: F) -> Result<(), E>
where
    B: Backend,
    F: FnMut(&str) -> Result<(), E>,
    E: From<WriterError>,
{
    let handle = open(backend, path)?;
    let mut visitor_error = None;

    let walked = handle.walk_keys(from, &mut |key: &str| -> StoreResult<ControlFlow<()>> {
        if past_end(key, to) {
            return Ok(ControlFlow::Break(()));
        }
        match visit(key) {
            Ok(()) => Ok(ControlFlow::Continue(())),
            Err(e) => {
                visitor_error = Some(e);
                Ok(ControlFlow::Break(()))
            }
        }
    });
    release(handle, path);

    if let Some(e) = visitor_error {
        return Err(e);
    }
    walked.map_err(|e| E::from(WriterError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use tempfile::TempDir;
    use tidepool_core::Store;

    fn seeded(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("m.tide");
        let mut store = Store::open(&path, true).unwrap();
        let mut bulk = store.bulk();
        for key in ["a", "b", "c", "d"] {
            bulk.set(key, key.to_uppercase().into_bytes());
        }
        store.commit(&mut bulk).unwrap();
        store.close().unwrap();
        path
    }

    fn collect(path: &Path, from: &str, to: &str) -> Vec<String> {
        let mut keys = Vec::new();
        scan_range::<_, _, WriterError>(&FileBackend, path, from, to, |k, _| {
            keys.push(k.to_string());
            Ok(())
        })
        .unwrap();
        keys
    }

    #[test]
    fn test_range_is_half_open() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir);
        assert_eq!(collect(&path, "a", "c"), vec!["a", "b"]);
        assert_eq!(collect(&path, "b", ""), vec!["b", "c", "d"]);
        assert_eq!(collect(&path, "", ""), vec!["a", "b", "c", "d"]);
        assert!(collect(&path, "c", "c").is_empty());
        assert!(collect(&path, "d", "a").is_empty());
    }

    #[test]
    fn test_get_and_missing_key() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir);
        assert_eq!(get(&FileBackend, &path, "b").unwrap(), b"B");
        assert!(get(&FileBackend, &path, "zz").unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_store_is_open_error() {
        let dir = TempDir::new().unwrap();
        let err = get(&FileBackend, &dir.path().join("none.tide"), "a").unwrap_err();
        assert!(err.is_open_error());
    }

    #[derive(Debug, PartialEq)]
    enum ScanError {
        Stop(String),
        Writer(String),
    }

    impl From<WriterError> for ScanError {
        fn from(e: WriterError) -> Self {
            ScanError::Writer(e.to_string())
        }
    }

    #[test]
    fn test_visitor_error_stops_scan() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir);
        let mut seen = Vec::new();
        let err = scan_range(&FileBackend, &path, "", "", |k, _| {
            seen.push(k.to_string());
            if k == "b" {
                return Err(ScanError::Stop(k.to_string()));
            }
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err, ScanError::Stop("b".into()));
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_scan_keys() {
        let dir = TempDir::new().unwrap();
        let path = seeded(&dir);
        let mut keys = Vec::new();
        scan_keys::<_, _, WriterError>(&FileBackend, &path, "b", "d", |k| {
            keys.push(k.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
