//! Binary format definitions for Tidepool store files
//!
//! A store file is a file header followed by an append-only run of records:
//!
//! ```text
//! FileHeader (8 bytes) | Record | Record | ...
//! Record = RecordHeader (16 bytes) + key_bytes + value_bytes
//! ```
//!
//! A later record for the same key supersedes earlier ones; a tombstone
//! record (flag bit 0) deletes the key.

use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// Magic bytes opening every store file: "TIDE"
pub const FILE_MAGIC: [u8; 4] = [0x54, 0x49, 0x44, 0x45];

/// Magic bytes opening every record: "TREC"
pub const RECORD_MAGIC: [u8; 4] = [0x54, 0x52, 0x45, 0x43];

/// Current file format version
pub const FORMAT_VERSION: u16 = 1;

/// File header size in bytes
pub const FILE_HEADER_SIZE: usize = 8;

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 16;

/// Maximum key size in bytes
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum value size in bytes (32MB)
pub const MAX_VALUE_SIZE: usize = 32 * 1024 * 1024;

/// Tombstone flag in the flags byte
const FLAG_TOMBSTONE: u8 = 0x01;

/// Encode the file header.
///
/// Layout:
///   [0..4] magic:   [u8;4] - "TIDE"
///   [4..6] version: u16 LE
///   [6..8] reserved
pub fn file_header() -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&FILE_MAGIC);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

/// Validate a file header read from `path`.
pub fn check_file_header(path: &Path, buf: &[u8; FILE_HEADER_SIZE]) -> StoreResult<()> {
    if buf[0..4] != FILE_MAGIC {
        return Err(StoreError::Open {
            path: path.to_path_buf(),
            kind: None,
            reason: "not a tidepool store (bad file magic)".to_string(),
        });
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != FORMAT_VERSION {
        return Err(StoreError::Open {
            path: path.to_path_buf(),
            kind: None,
            reason: format!("unsupported format version {}", version),
        });
    }
    Ok(())
}

/// Fixed-size header for each record.
/// Size: 16 bytes
///
/// Layout:
///   [0..4]   magic:     [u8;4] - "TREC"
///   [4..6]   key_len:   u16 LE
///   [6]      flags:     u8     - bit 0 = tombstone
///   [7]      reserved:  u8
///   [8..12]  value_len: u32 LE
///   [12..16] checksum:  u32 LE - CRC32C of (key_bytes + value_bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub key_len: u16,
    pub flags: u8,
    pub value_len: u32,
    pub checksum: u32,
}

impl RecordHeader {
    /// Header for a live key/value record or a tombstone.
    pub fn new(key: &[u8], value: &[u8], tombstone: bool) -> Self {
        Self {
            magic: RECORD_MAGIC,
            key_len: key.len() as u16,
            flags: if tombstone { FLAG_TOMBSTONE } else { 0 },
            value_len: value.len() as u32,
            checksum: record_checksum(key, value),
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.key_len.to_le_bytes());
        buf[6] = self.flags;
        buf[8..12].copy_from_slice(&self.value_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        Self {
            magic,
            key_len: u16::from_le_bytes([buf[4], buf[5]]),
            flags: buf[6],
            value_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            checksum: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        (self.flags & FLAG_TOMBSTONE) != 0
    }

    /// Whole record length on disk, header included.
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.key_len as u64 + self.value_len as u64
    }

    /// Size fields are within the format limits.
    pub fn sizes_valid(&self) -> bool {
        self.key_len as usize <= MAX_KEY_SIZE && self.value_len as usize <= MAX_VALUE_SIZE
    }
}

/// CRC32C over key bytes followed by value bytes.
pub fn record_checksum(key: &[u8], value: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(key), value)
}

/// Reject keys and values the format cannot hold, before any allocation.
pub fn check_sizes(key: &[u8], value: &[u8]) -> StoreResult<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(StoreError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(StoreError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value".to_string(),
        });
    }
    Ok(())
}

/// Append one encoded record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8], tombstone: bool) -> StoreResult<()> {
    let value: &[u8] = if tombstone { &[] } else { value };
    check_sizes(key, value)?;
    let header = RecordHeader::new(key, value, tombstone);
    buf.reserve(header.record_len() as usize);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_header_layout() {
        let header = RecordHeader::new(b"key", b"value", false);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &RECORD_MAGIC);
        assert_eq!(RecordHeader::from_bytes(&bytes), header);
        assert_eq!(header.record_len(), (RECORD_HEADER_SIZE + 3 + 5) as u64);
    }

    #[test]
    fn test_checksum_matches_concatenation() {
        assert_eq!(record_checksum(b"ab", b"cd"), crc32c::crc32c(b"abcd"));
    }

    #[test]
    fn test_tombstone_drops_value() {
        let mut buf = Vec::new();
        encode_record(&mut buf, b"gone", b"ignored", true).unwrap();
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 4);

        let mut hdr = [0u8; RECORD_HEADER_SIZE];
        hdr.copy_from_slice(&buf[..RECORD_HEADER_SIZE]);
        let header = RecordHeader::from_bytes(&hdr);
        assert!(header.is_tombstone());
        assert_eq!(header.value_len, 0);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; MAX_KEY_SIZE + 1];
        let mut buf = Vec::new();
        let result = encode_record(&mut buf, &key, b"val", false);
        assert!(matches!(result, Err(StoreError::OversizedEntry { component, .. }) if component == "key"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_key_size_accepted() {
        let key = vec![0x41u8; MAX_KEY_SIZE];
        assert!(check_sizes(&key, b"v").is_ok());
    }

    #[test]
    fn test_file_header_checks() {
        let path = PathBuf::from("/tmp/x.tide");
        assert!(check_file_header(&path, &file_header()).is_ok());

        let mut bad = file_header();
        bad[0] = b'X';
        assert!(matches!(check_file_header(&path, &bad), Err(StoreError::Open { .. })));

        let mut future = file_header();
        future[4] = 9;
        let err = check_file_header(&path, &future).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 9"));
    }
}
