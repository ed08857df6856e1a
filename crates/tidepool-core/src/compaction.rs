//! Compaction — dead space reclamation for store files
//!
//! Over time a store file accumulates tombstones and superseded values.
//! Compaction writes only the live entries, in key order, to a separate
//! file, and a later rename installs it over the original.
//!
//! The two halves are kept apart so the caller decides when to swap:
//! 1. `write_compacted` fills and durable_syncs the temporary file
//! 2. `install_compacted` renames it over the original (atomic on POSIX)
//!    and durable_syncs the parent directory
//!
//! A crash before the rename leaves the original intact and an orphaned
//! temporary file; after it, the compacted file is the store.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{StoreError, StoreResult};
use crate::format::{encode_record, file_header};
use crate::platform_durability::durable_sync;

/// Suffix appended to a store path for its compaction output.
pub const COMPACT_SUFFIX: &str = ".compact";

/// Result of a compaction operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Records in the original file, including tombstones and overwrites
    pub original_records: usize,
    /// Live entries written to the compacted file
    pub live_entries: usize,
    /// Original file size in bytes
    pub original_bytes: u64,
    /// Compacted file size in bytes
    pub compacted_bytes: u64,
}

impl CompactionStats {
    /// Ratio of dead records in the original file (0.0 = no waste, 1.0 = all waste).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_records == 0 {
            return 0.0;
        }
        let dead = self.original_records.saturating_sub(self.live_entries);
        dead as f64 / self.original_records as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Write `entries` as a fresh store file at `dest`, replacing anything there.
///
/// Entries must already be deduplicated; they are written in the order given.
/// Returns the number of entries and the resulting file size.
pub fn write_compacted<I, K, V>(dest: &Path, entries: I) -> StoreResult<(usize, u64)>
where
    I: IntoIterator<Item = StoreResult<(K, V)>>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .map_err(|e| StoreError::io(dest, e, "Failed to create compact file"))?;

    let mut out = BufWriter::new(&file);
    out.write_all(&file_header())
        .map_err(|e| StoreError::io(dest, e, "Failed to write compact header"))?;

    let mut count = 0usize;
    let mut record = Vec::new();
    for entry in entries {
        let (key, value) = entry?;
        record.clear();
        encode_record(&mut record, key.as_ref(), value.as_ref(), false)?;
        out.write_all(&record)
            .map_err(|e| StoreError::io(dest, e, "Failed to write compacted entry"))?;
        count += 1;
    }
    out.flush()
        .map_err(|e| StoreError::io(dest, e, "Failed to flush compact file"))?;
    drop(out);

    durable_sync(&file).map_err(|e| StoreError::io(dest, e, "Failed to sync compacted file"))?;

    let size = file
        .metadata()
        .map_err(|e| StoreError::io(dest, e, "Failed to stat compacted file"))?
        .len();
    Ok((count, size))
}

/// Atomically replace `target` with the compacted file at `compacted`.
///
/// Readers opening `target` see either the old or the new file, never a
/// missing or partial one.
pub fn install_compacted(compacted: &Path, target: &Path) -> StoreResult<()> {
    fs::rename(compacted, target)
        .map_err(|e| StoreError::io(target, e, "Failed to rename compacted file"))?;

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Remove a leftover compaction output, ignoring a file that is not there.
pub fn discard_compacted(compacted: &Path) -> StoreResult<()> {
    match fs::remove_file(compacted) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(compacted, e, "Failed to remove compact file")),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StoreResult<()> {
    let handle = File::open(dir)
        .map_err(|e| StoreError::io(dir, e, "Failed to open directory for sync"))?;
    durable_sync(&handle)
        .map_err(|e| StoreError::io(dir, e, "Failed to sync directory after compaction"))
}

// Directory handles cannot be synced on Windows; the rename is already durable there.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StoreResult<()> {
    Ok(())
}
