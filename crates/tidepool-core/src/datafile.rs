//! Data file access for Tidepool stores
//!
//! Opening, scanning, reading and appending records in a single store
//! file. Every record carries a CRC32C checksum; scans skip damaged
//! records and resynchronise on the next record magic.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::format::{
    check_file_header, file_header, record_checksum, RecordHeader, FILE_HEADER_SIZE,
    RECORD_HEADER_SIZE, RECORD_MAGIC,
};
use crate::platform_durability::durable_sync;

/// Location and shape of one record found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: String,
    pub offset: u64,
    pub value_len: u32,
    pub tombstone: bool,
}

/// Result of scanning a whole data file.
#[derive(Debug, Default)]
pub struct ScanSummary {
    /// Valid records in file order
    pub records: Vec<RecordMeta>,
    /// Records dropped for bad checksums, bad keys or bad sizes
    pub skipped: usize,
    /// Offset just past the last valid record
    pub end: u64,
}

/// Open a store file for reading and appending.
///
/// With `create` a missing file is created with a fresh header. Without it
/// a missing file is an `Open` error. Either way the header is validated.
pub fn open_data_file(path: &Path, create: bool) -> StoreResult<File> {
    let mut options = OpenOptions::new();
    options.read(true).append(true).create(create);

    let mut file = options.open(path).map_err(|e| StoreError::Open {
        path: path.to_path_buf(),
        kind: Some(e.kind()),
        reason: e.to_string(),
    })?;

    let len = file
        .metadata()
        .map_err(|e| StoreError::io(path, e, "Failed to stat store file"))?
        .len();

    if len == 0 && create {
        file.write_all(&file_header())
            .map_err(|e| StoreError::io(path, e, "Failed to write store header"))?;
        durable_sync(&file).map_err(|e| StoreError::io(path, e, "Failed to sync store header"))?;
        return Ok(file);
    }

    if len < FILE_HEADER_SIZE as u64 {
        return Err(StoreError::Open {
            path: path.to_path_buf(),
            kind: None,
            reason: format!("file too short for header: {} bytes", len),
        });
    }

    let mut header = [0u8; FILE_HEADER_SIZE];
    (&file).seek(SeekFrom::Start(0))?;
    (&file).read_exact(&mut header).map_err(|e| StoreError::Open {
        path: path.to_path_buf(),
        kind: Some(e.kind()),
        reason: format!("failed to read header: {}", e),
    })?;
    check_file_header(path, &header)?;

    Ok(file)
}

/// Scan every record in the file.
///
/// A truncated tail (a record cut short by a crash or by a concurrent
/// append) ends the scan. Damaged records are skipped, and scanning resumes
/// at the next record magic so records appended after a torn write survive.
pub fn scan_records(file: &File, path: &Path) -> StoreResult<ScanSummary> {
    let file_len = file
        .metadata()
        .map_err(|e| StoreError::io(path, e, "Failed to stat store file for scan"))?
        .len();

    let mut reader = BufReader::new(file);
    let mut summary = ScanSummary {
        end: FILE_HEADER_SIZE as u64,
        ..Default::default()
    };
    let mut offset = FILE_HEADER_SIZE as u64;

    while offset + RECORD_HEADER_SIZE as u64 <= file_len {
        reader.seek(SeekFrom::Start(offset))?;

        let mut hdr_buf = [0u8; RECORD_HEADER_SIZE];
        if reader.read_exact(&mut hdr_buf).is_err() {
            break;
        }
        let hdr = RecordHeader::from_bytes(&hdr_buf);

        if hdr.magic != RECORD_MAGIC || !hdr.sizes_valid() {
            summary.skipped += 1;
            match find_next_magic(&mut reader, offset + 1, file_len) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        // A record that runs past the end or fails its checksum may be a torn
        // write with later records behind it, so resync on the next magic
        // instead of trusting its length.
        let Some(key) = read_verified_key(&mut reader, &hdr, offset, file_len) else {
            match find_next_magic(&mut reader, offset + 1, file_len) {
                Some(next) => {
                    warn!(path = %path.display(), offset, resume = next, "Damaged or torn record, resyncing");
                    summary.skipped += 1;
                    offset = next;
                    continue;
                }
                None => break, // torn tail
            }
        };

        match String::from_utf8(key) {
            Ok(key) => summary.records.push(RecordMeta {
                key,
                offset,
                value_len: hdr.value_len,
                tombstone: hdr.is_tombstone(),
            }),
            Err(_) => {
                warn!(path = %path.display(), offset, "non UTF-8 key, skipping record");
                summary.skipped += 1;
            }
        }

        offset += hdr.record_len();
        summary.end = offset;
    }

    Ok(summary)
}

/// Key bytes of the record whose header was just read, if the whole record
/// is present and passes its checksum.
fn read_verified_key<R: Read>(reader: &mut R, hdr: &RecordHeader, offset: u64, file_len: u64) -> Option<Vec<u8>> {
    if offset + hdr.record_len() > file_len {
        return None;
    }
    let mut key = vec![0u8; hdr.key_len as usize];
    let mut value = vec![0u8; hdr.value_len as usize];
    reader.read_exact(&mut key).ok()?;
    reader.read_exact(&mut value).ok()?;
    (record_checksum(&key, &value) == hdr.checksum).then_some(key)
}

/// Read the value of the record at `offset`, verifying its checksum and key.
pub fn read_value(file: &File, path: &Path, offset: u64, key: &str) -> StoreResult<Vec<u8>> {
    let mut reader = file;
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| StoreError::io(path, e, "Failed to seek to record"))?;

    let mut hdr_buf = [0u8; RECORD_HEADER_SIZE];
    reader.read_exact(&mut hdr_buf).map_err(|e| {
        StoreError::io(path, e, &format!("Failed to read record header at offset {}", offset))
    })?;
    let hdr = RecordHeader::from_bytes(&hdr_buf);

    if hdr.magic != RECORD_MAGIC {
        return Err(StoreError::NoMagicFound {
            path: path.to_path_buf(),
            offset,
            found_bytes: hdr.magic,
        });
    }
    if !hdr.sizes_valid() {
        return Err(StoreError::Corrupted {
            path: path.to_path_buf(),
            offset,
            reason: format!("bad sizes: key {} value {}", hdr.key_len, hdr.value_len),
        });
    }

    let mut stored_key = vec![0u8; hdr.key_len as usize];
    reader.read_exact(&mut stored_key)?;
    let mut value = vec![0u8; hdr.value_len as usize];
    reader.read_exact(&mut value)?;

    let computed = record_checksum(&stored_key, &value);
    if computed != hdr.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: hdr.checksum,
            actual: computed,
            offset,
        });
    }
    if stored_key != key.as_bytes() {
        return Err(StoreError::Corrupted {
            path: path.to_path_buf(),
            offset,
            reason: format!("index points at a record for another key than {:?}", key),
        });
    }

    Ok(value)
}

/// Append pre-encoded records and make them durable with one sync.
pub fn append_records(file: &File, path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut writer = file;
    writer
        .write_all(bytes)
        .map_err(|e| StoreError::io(path, e, "Store append failed"))?;
    durable_sync(file).map_err(|e| StoreError::io(path, e, "Store durable_sync failed"))
}

/// Current on-disk length of the file.
pub fn file_len(file: &File, path: &Path) -> StoreResult<u64> {
    Ok(file
        .metadata()
        .map_err(|e| StoreError::io(path, e, "Failed to stat store file"))?
        .len())
}

/// Scan forward to the next record magic (corruption recovery).
fn find_next_magic<R: Read + Seek>(reader: &mut R, start: u64, file_len: u64) -> Option<u64> {
    let mut buf = [0u8; 4096];
    let mut pos = start;

    while pos + 4 <= file_len {
        reader.seek(SeekFrom::Start(pos)).ok()?;
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return None,
        };
        if n < 4 {
            return None;
        }

        if let Some(i) = buf[..n].windows(4).position(|w| w == RECORD_MAGIC) {
            return Some(pos + i as u64);
        }
        pos += (n - 3) as u64;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::encode_record;
    use tempfile::TempDir;

    fn encoded(records: &[(&str, &str, bool)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (k, v, tomb) in records {
            encode_record(&mut buf, k.as_bytes(), v.as_bytes(), *tomb).unwrap();
        }
        buf
    }

    #[test]
    fn test_open_missing_without_create() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.tide");
        let err = open_data_file(&path, false).unwrap_err();
        assert!(matches!(err, StoreError::Open { kind: Some(ErrorKind::NotFound), .. }));
    }

    #[test]
    fn test_create_writes_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fresh.tide");
        let file = open_data_file(&path, true).unwrap();
        assert_eq!(file_len(&file, &path).unwrap(), FILE_HEADER_SIZE as u64);
        drop(file);

        // Reopen validates the header
        assert!(open_data_file(&path, false).is_ok());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("junk.tide");
        std::fs::write(&path, b"definitely not a store").unwrap();
        assert!(matches!(open_data_file(&path, false), Err(StoreError::Open { .. })));
    }

    #[test]
    fn test_append_scan_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.tide");
        let file = open_data_file(&path, true).unwrap();

        append_records(&file, &path, &encoded(&[("k1", "v1", false), ("k2", "", true), ("k3", "v3", false)]))
            .unwrap();

        let summary = scan_records(&file, &path).unwrap();
        assert_eq!(summary.records.len(), 3);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.end, file_len(&file, &path).unwrap());
        assert!(summary.records[1].tombstone);

        let third = &summary.records[2];
        assert_eq!(read_value(&file, &path, third.offset, "k3").unwrap(), b"v3");
        assert!(matches!(
            read_value(&file, &path, third.offset, "k1"),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_scan_stops_at_truncated_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.tide");
        let file = open_data_file(&path, true).unwrap();

        let full = encoded(&[("a", "1", false), ("b", "2", false)]);
        let cut = full.len() - 1;
        append_records(&file, &path, &full[..cut]).unwrap();

        let summary = scan_records(&file, &path).unwrap();
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].key, "a");
    }

    #[test]
    fn test_scan_skips_corrupted_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.tide");
        let file = open_data_file(&path, true).unwrap();
        append_records(&file, &path, &encoded(&[("a", "1", false), ("b", "2", false)])).unwrap();

        // Flip the value byte of the first record
        let mut bytes = std::fs::read(&path).unwrap();
        let first_value = FILE_HEADER_SIZE + RECORD_HEADER_SIZE + 1;
        bytes[first_value] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let file = open_data_file(&path, false).unwrap();
        let summary = scan_records(&file, &path).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].key, "b");
    }

    #[test]
    fn test_scan_resyncs_past_torn_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("torn.tide");
        let file = open_data_file(&path, true).unwrap();
        append_records(&file, &path, &encoded(&[("a", "1", false)])).unwrap();

        // First 100 bytes of a ~520 byte record, as left by a crash mid-append
        let big = "x".repeat(500);
        let torn = encoded(&[("torn", big.as_str(), false)]);
        append_records(&file, &path, &torn[..100]).unwrap();

        // A short record whose end falls inside the torn record's claimed
        // length, then one long enough to fill it
        let long = "y".repeat(600);
        append_records(&file, &path, &encoded(&[("short", "s", false), ("long", long.as_str(), false)])).unwrap();

        let summary = scan_records(&file, &path).unwrap();
        let keys: Vec<&str> = summary.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "short", "long"]);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.end, file_len(&file, &path).unwrap());
    }
}
