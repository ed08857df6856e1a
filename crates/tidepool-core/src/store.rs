//! Store — one named, file-backed keyed collection.
//!
//! A `Store` owns an open store file and an ordered in-memory index from
//! key to the offset of its latest record. Values stay on disk and are
//! read (and checksum-verified) on demand.
//!
//! **Read path**: index lookup, then one positioned read
//! **Write path**: accumulate in a `Bulk`, then `commit` appends every
//! record in one write followed by a single durable sync
//!
//! Several `Store` instances may be open on the same path in one process.
//! Only one of them should commit; the others see a snapshot taken when
//! they were opened.

use std::collections::BTreeMap;
use std::fs::File;
use std::ops::{Bound, ControlFlow};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::compaction::{write_compacted, CompactionStats};
use crate::datafile::{append_records, file_len, open_data_file, read_value, scan_records};
use crate::error::{StoreError, StoreResult};
use crate::format::encode_record;

/// A pending mutation inside a `Bulk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BulkOp {
    pub fn key(&self) -> &str {
        match self {
            BulkOp::Set { key, .. } | BulkOp::Delete { key } => key,
        }
    }
}

/// Batch context: writes and deletes accumulated for one commit.
///
/// Operations apply in insertion order, so a set followed by a delete of
/// the same key leaves the key absent.
#[derive(Debug, Default, Clone)]
pub struct Bulk {
    ops: Vec<BulkOp>,
}

impl Bulk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a set of `key` to `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.ops.push(BulkOp::Set { key: key.into(), value: value.into() });
    }

    /// Queue a delete of `key`.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BulkOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop every queued operation.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn ops(&self) -> &[BulkOp] {
        &self.ops
    }
}

/// Where the latest record of a key lives.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    value_len: u32,
}

/// An open store file plus its key index.
pub struct Store {
    file: File,
    path: PathBuf,
    index: BTreeMap<String, Slot>,
    /// Physical file length; the next commit lands here
    end: u64,
    /// Records on disk, including tombstones and superseded values
    records: usize,
}

impl Store {
    /// Open the store at `path`, creating an empty one if `create` is set.
    ///
    /// Fails with `StoreError::Open` if the file is missing (and `create`
    /// is false) or is not a store file.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_data_file(&path, create)?;
        let summary = scan_records(&file, &path)?;

        let mut index = BTreeMap::new();
        let records = summary.records.len();
        for record in summary.records {
            if record.tombstone {
                index.remove(&record.key);
            } else {
                let slot = Slot { offset: record.offset, value_len: record.value_len };
                index.insert(record.key, slot);
            }
        }

        if summary.skipped > 0 {
            warn!(path = %path.display(), skipped = summary.skipped, "Skipped damaged records on open");
        }
        // Appends land at the physical end, past any unreadable tail. Scans
        // resync on the record magic, so records written after it stay readable.
        let end = file_len(&file, &path)?;
        if end > summary.end {
            warn!(path = %path.display(), tail_bytes = end - summary.end, "Unreadable tail after last valid record");
        }
        debug!(path = %path.display(), keys = index.len(), records, "Opened store");

        Ok(Self { file, path, index, end, records })
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let slot = self
            .index
            .get(key)
            .ok_or_else(|| StoreError::KeyNotFound { key: key.to_string() })?;
        let value = read_value(&self.file, &self.path, slot.offset, key)?;
        debug_assert_eq!(value.len(), slot.value_len as usize);
        Ok(value)
    }

    /// Visit entries in ascending key order, starting at the first key >= `from`.
    ///
    /// The walk ends when the visitor returns `Break` or an error, or when
    /// the keys run out.
    pub fn walk<F>(&self, from: &str, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&str, &[u8]) -> StoreResult<ControlFlow<()>>,
    {
        for (key, slot) in self.index.range::<str, _>((Bound::Included(from), Bound::Unbounded)) {
            let value = read_value(&self.file, &self.path, slot.offset, key)?;
            if visit(key, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Like `walk`, without reading values.
    pub fn walk_keys<F>(&self, from: &str, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&str) -> StoreResult<ControlFlow<()>>,
    {
        for key in self.index.range::<str, _>((Bound::Included(from), Bound::Unbounded)).map(|(k, _)| k) {
            if visit(key)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Start a new batch context.
    pub fn bulk(&self) -> Bulk {
        Bulk::new()
    }

    /// Apply every queued operation with one append and one durable sync.
    ///
    /// Operations the record format cannot hold (oversized keys or values)
    /// are logged and dropped so they never hold back the rest of the batch.
    /// On success the bulk is emptied and the number of applied operations
    /// returned. On failure the bulk is left intact so it can be retried.
    pub fn commit(&mut self, bulk: &mut Bulk) -> StoreResult<usize> {
        if bulk.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        let mut placed = Vec::with_capacity(bulk.len());
        for op in bulk.ops() {
            let offset = self.end + buf.len() as u64;
            let encoded = match op {
                BulkOp::Set { key, value } => encode_record(&mut buf, key.as_bytes(), value, false)
                    .map(|()| Some(Slot { offset, value_len: value.len() as u32 })),
                BulkOp::Delete { key } => encode_record(&mut buf, key.as_bytes(), &[], true).map(|()| None),
            };
            match encoded {
                Ok(slot) => placed.push((op.key(), slot)),
                Err(e) => {
                    warn!(path = %self.path.display(), key_len = op.key().len(), error = %e, "Dropping operation that cannot be stored");
                }
            }
        }

        if !buf.is_empty() {
            if let Err(e) = append_records(&self.file, &self.path, &buf) {
                // A partial append leaves an unindexed tail; new records go after it.
                self.end = file_len(&self.file, &self.path).unwrap_or(self.end);
                return Err(e);
            }
        }

        let applied = placed.len();
        for (key, slot) in placed {
            match slot {
                Some(slot) => {
                    self.index.insert(key.to_string(), slot);
                }
                None => {
                    self.index.remove(key);
                }
            }
        }

        self.end += buf.len() as u64;
        self.records += applied;
        bulk.clear();
        Ok(applied)
    }

    /// Write the live entries, in key order, as a fresh store file at `dest`.
    ///
    /// The store itself is untouched; installing the result is up to the caller.
    pub fn compact_to(&self, dest: &Path) -> StoreResult<CompactionStats> {
        let entries = self
            .index
            .iter()
            .map(|(key, slot)| read_value(&self.file, &self.path, slot.offset, key).map(|v| (key, v)));
        let (live_entries, compacted_bytes) = write_compacted(dest, entries)?;

        Ok(CompactionStats {
            original_records: self.records,
            live_entries,
            original_bytes: self.end,
            compacted_bytes,
        })
    }

    /// Close the store, syncing anything the OS still buffers.
    pub fn close(self) -> StoreResult<()> {
        crate::platform_durability::durable_sync(&self.file)
            .map_err(|e| StoreError::io(&self.path, e, "Failed to sync store on close"))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the store has no live keys.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Records on disk, including dead ones.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("keys", &self.index.len())
            .field("records", &self.records)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.tide"), true).unwrap();
        (store, dir)
    }

    fn put(store: &mut Store, pairs: &[(&str, &str)]) {
        let mut bulk = store.bulk();
        for (k, v) in pairs {
            bulk.set(*k, v.as_bytes());
        }
        store.commit(&mut bulk).unwrap();
    }

    fn collect(store: &Store, from: &str) -> Vec<(String, Vec<u8>)> {
        let mut seen = Vec::new();
        store
            .walk(from, |k, v| {
                seen.push((k.to_string(), v.to_vec()));
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_open_empty() {
        let (store, _dir) = test_store();
        assert!(store.is_empty());
        assert_eq!(store.record_count(), 0);
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let err = Store::open(dir.path().join("nope.tide"), false).unwrap_err();
        assert!(matches!(err, StoreError::Open { .. }));
    }

    #[test]
    fn test_commit_get() {
        let (mut store, _dir) = test_store();
        put(&mut store, &[("hello", "world")]);
        assert_eq!(store.get("hello").unwrap(), b"world");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing_key() {
        let (store, _dir) = test_store();
        assert!(store.get("absent").unwrap_err().is_not_found());
    }

    #[test]
    fn test_commit_empties_bulk() {
        let (mut store, _dir) = test_store();
        let mut bulk = store.bulk();
        bulk.set("a", b"1".to_vec());
        bulk.delete("b");
        assert_eq!(store.commit(&mut bulk).unwrap(), 2);
        assert!(bulk.is_empty());
        assert_eq!(store.commit(&mut bulk).unwrap(), 0);
    }

    #[test]
    fn test_bulk_applies_in_order() {
        let (mut store, _dir) = test_store();
        let mut bulk = store.bulk();
        bulk.set("k", b"v1".to_vec());
        bulk.set("k", b"v2".to_vec());
        bulk.set("gone", b"x".to_vec());
        bulk.delete("gone");
        store.commit(&mut bulk).unwrap();

        assert_eq!(store.get("k").unwrap(), b"v2");
        assert!(store.get("gone").unwrap_err().is_not_found());
        assert_eq!(store.record_count(), 4);
    }

    #[test]
    fn test_oversized_ops_do_not_block_batch() {
        let (mut store, _dir) = test_store();
        let mut bulk = store.bulk();
        bulk.set("good0", b"a".to_vec());
        bulk.set("k".repeat(crate::format::MAX_KEY_SIZE + 1), b"v".to_vec());
        bulk.set("big", vec![0u8; crate::format::MAX_VALUE_SIZE + 1]);
        bulk.set("good1", b"b".to_vec());

        assert_eq!(store.commit(&mut bulk).unwrap(), 2);
        assert!(bulk.is_empty());
        assert_eq!(store.get("good0").unwrap(), b"a");
        assert_eq!(store.get("good1").unwrap(), b"b");
        assert!(store.get("big").unwrap_err().is_not_found());
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_commit_after_torn_tail_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.tide");
        let mut store = Store::open(&path, true).unwrap();
        put(&mut store, &[("before", "1")]);
        store.close().unwrap();

        let mut torn = Vec::new();
        crate::format::encode_record(&mut torn, b"torn", &[7u8; 500], false).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, &torn[..100]).unwrap();
        drop(file);

        let mut store = Store::open(&path, false).unwrap();
        put(&mut store, &[("after", "2")]);
        assert_eq!(store.get("after").unwrap(), b"2");
        store.close().unwrap();

        let store = Store::open(&path, false).unwrap();
        assert_eq!(store.get("before").unwrap(), b"1");
        assert_eq!(store.get("after").unwrap(), b"2");
        assert!(store.get("torn").unwrap_err().is_not_found());
    }

    #[test]
    fn test_reopen_recovers_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tide");
        {
            let mut store = Store::open(&path, true).unwrap();
            put(&mut store, &[("survive1", "yes"), ("survive2", "also_yes"), ("doomed", "temp")]);
            let mut bulk = store.bulk();
            bulk.delete("doomed");
            store.commit(&mut bulk).unwrap();
            store.close().unwrap();
        }
        let store = Store::open(&path, false).unwrap();
        assert_eq!(store.get("survive1").unwrap(), b"yes");
        assert_eq!(store.get("survive2").unwrap(), b"also_yes");
        assert!(store.get("doomed").unwrap_err().is_not_found());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_walk_ordered_from() {
        let (mut store, _dir) = test_store();
        put(&mut store, &[("c", "3"), ("a", "1"), ("b", "2")]);

        let keys: Vec<_> = collect(&store, "").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let from_b = collect(&store, "b");
        assert_eq!(from_b, vec![("b".to_string(), b"2".to_vec()), ("c".to_string(), b"3".to_vec())]);

        // A start key between stored keys begins at the next one
        let from_bb: Vec<_> = collect(&store, "bb").into_iter().map(|(k, _)| k).collect();
        assert_eq!(from_bb, vec!["c"]);
    }

    #[test]
    fn test_walk_break_and_error() {
        let (mut store, _dir) = test_store();
        put(&mut store, &[("a", "1"), ("b", "2"), ("c", "3")]);

        let mut seen = 0;
        store
            .walk("", |_, _| {
                seen += 1;
                Ok(if seen == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
            })
            .unwrap();
        assert_eq!(seen, 2);

        let err = store
            .walk_keys("", |k| Err(StoreError::KeyNotFound { key: k.to_string() }))
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { key } if key == "a"));
    }

    #[test]
    fn test_second_handle_sees_committed_data() {
        let (mut store, _dir) = test_store();
        put(&mut store, &[("shared", "yes")]);

        let reader = Store::open(store.path(), false).unwrap();
        assert_eq!(reader.get("shared").unwrap(), b"yes");
    }

    #[test]
    fn test_compact_to_keeps_live_entries() {
        let (mut store, dir) = test_store();
        put(&mut store, &[("keep", "alive"), ("stale", "old"), ("dead", "temporary")]);
        put(&mut store, &[("stale", "new")]);
        let mut bulk = store.bulk();
        bulk.delete("dead");
        store.commit(&mut bulk).unwrap();

        let dest = dir.path().join("test.tide.compact");
        let stats = store.compact_to(&dest).unwrap();
        assert_eq!(stats.original_records, 5);
        assert_eq!(stats.live_entries, 2);
        assert!(stats.compacted_bytes < stats.original_bytes);

        let compacted = Store::open(&dest, false).unwrap();
        assert_eq!(compacted.record_count(), 2);
        assert_eq!(compacted.get("keep").unwrap(), b"alive");
        assert_eq!(compacted.get("stale").unwrap(), b"new");

        // Original untouched
        assert!(store.get("dead").unwrap_err().is_not_found());
        assert_eq!(store.record_count(), 5);
    }
}
