//! Mapping between store names and files under the root directory.
//!
//! A store named `n` lives at `<root>/<n>.<ext>`. Names may contain `/`
//! to reach nested directories. Validation keeps every name inside the
//! root so the mapping stays one-to-one.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tidepool_core::COMPACT_SUFFIX;
use tracing::warn;

use crate::error::{WriterError, WriterResult};

/// Store file layout under one root directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    extension: String,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self { root: root.into(), extension: extension.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Check that `name` maps to a file inside the root.
    pub fn validate_name(&self, name: &str) -> WriterResult<()> {
        let invalid = |reason: &str| WriterError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("empty"));
        }
        if name.contains('\\') || name.contains('\0') {
            return Err(invalid("contains a backslash or NUL"));
        }
        if name.ends_with(COMPACT_SUFFIX) {
            return Err(invalid("uses the compaction suffix"));
        }
        for part in name.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(invalid("empty, '.' or '..' path component"));
            }
        }
        if Path::new(name).components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(invalid("not a relative path"));
        }
        Ok(())
    }

    /// File path of the store called `name`.
    pub fn path_for(&self, name: &str) -> WriterResult<PathBuf> {
        self.validate_name(name)?;
        let mut path = self.root.clone();
        for part in name.split('/') {
            path.push(part);
        }
        let mut file = path.into_os_string();
        file.push(".");
        file.push(&self.extension);
        Ok(PathBuf::from(file))
    }

    /// Temporary compaction output for the store called `name`.
    pub fn compact_path_for(&self, name: &str) -> WriterResult<PathBuf> {
        let mut file = self.path_for(name)?.into_os_string();
        file.push(COMPACT_SUFFIX);
        Ok(PathBuf::from(file))
    }

    /// Store name for a file path under the root, if it is a store file.
    pub fn name_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }
        let joined = parts.join("/");
        let suffix = format!(".{}", self.extension);
        let name = joined.strip_suffix(&suffix)?;
        self.validate_name(name).ok()?;
        Some(name.to_string())
    }

    /// Names of every store under the root, sorted.
    ///
    /// Walks subdirectories too. Unreadable entries are logged and skipped.
    pub fn list_stores(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };
                let path = entry.path();
                match entry.file_type() {
                    Ok(kind) if kind.is_dir() => pending.push(path),
                    Ok(_) => {
                        if let Some(name) = self.name_for(&path) {
                            names.push(name);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping entry with unknown type");
                    }
                }
            }
        }

        names.sort();
        names
    }
}
