//! Tidepool Writer — write-behind batching over named stores
//!
//! Callers address stores by name. Writes are queued to a per-store
//! writer that commits them in batches; reads open their own short-lived
//! handle and see only committed data.
//!
//! # Architecture
//!
//! - **Registry**: name to writer table under one lock, at most one
//!   writer per name
//! - **Writer**: one thread per open store with a bounded inbox, a flush
//!   threshold, a flush timer and an idle tick; also runs compaction
//! - **Read path**: `get`, `scan_range` and `scan_keys` on transient handles
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), tidepool_writer::WriterError> {
//! use tidepool_writer::{Config, Registry};
//!
//! let registry = Registry::new(Config::interactive("/var/lib/tidepool"))?;
//! registry.create_store("cpu")?;
//! registry.store("cpu", "2024-01-01T00:00:00Z", b"0.42".to_vec()).await?;
//! registry.close("cpu").await?;
//! assert_eq!(registry.get("cpu", "2024-01-01T00:00:00Z")?, b"0.42");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod layout;
mod read;
pub mod registry;
pub mod writer;

pub use backend::{Backend, FileBackend, StoreHandle};
pub use config::{Config, DEFAULT_EXTENSION};
pub use error::{WriterError, WriterResult};
pub use layout::StoreLayout;
pub use registry::Registry;
pub use writer::{Lifecycle, WriterHandle, WriterStatsSnapshot};
