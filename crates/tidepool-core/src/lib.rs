//! Tidepool Core — single-file keyed store
//!
//! Each store is one file holding an append-only run of CRC32C-checksummed
//! records, indexed in RAM by key on open.
//!
//! # Architecture
//!
//! - **Read path**: ordered key index in RAM, values read from disk and verified
//! - **Write path**: `Bulk` batches appended with a single durable sync per commit
//! - **Compaction**: live entries rewritten to a temporary file, then renamed
//!   over the original
//!
//! The store knows nothing about names, batching policy or background
//! writers; `tidepool-writer` layers those on top.

pub mod compaction;
pub mod datafile;
pub mod error;
pub mod format;
pub mod platform_durability;
pub mod store;

// Re-export key types for convenience
pub use compaction::{discard_compacted, install_compacted, CompactionStats, COMPACT_SUFFIX};
pub use error::{StoreError, StoreResult};
pub use store::{Bulk, BulkOp, Store};
