//! Registry — the name to writer table and the public write/read surface.
//!
//! One lock guards the table and is only held for lookups and updates.
//! The first caller for a name leaves an `Opening` placeholder, opens the
//! store outside the lock on the blocking pool, and then installs the
//! writer. Callers racing on the same name wait on the placeholder, so the
//! store is still opened once and every caller ends up with the same
//! writer. Other names are never held up by an open in progress.
//!
//! Writers remove themselves when they retire, and only if the entry
//! still carries their id. A caller whose operation is refused by a
//! retiring writer waits for that writer to close and then resolves the
//! name again, which opens a fresh writer if needed. No accepted
//! operation is dropped by retirement.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tidepool_core::format::check_sizes;
use tidepool_core::{discard_compacted, CompactionStats, StoreError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::backend::{Backend, FileBackend, StoreHandle};
use crate::config::Config;
use crate::error::{WriterError, WriterResult};
use crate::layout::StoreLayout;
use crate::read;
use crate::writer::{self, Lifecycle, Op, WriterHandle, WriterSpec, WriterStatsSnapshot};

/// Table entry for one name.
enum Slot {
    /// Store being opened; flips to true once the opener is done either way
    Opening(Arc<watch::Sender<bool>>),
    Live(WriterHandle),
}

/// Live writers by store name.
#[derive(Default)]
pub(crate) struct WriterTable {
    writers: Mutex<HashMap<String, Slot>>,
}

impl WriterTable {
    fn get(&self, name: &str) -> Option<WriterHandle> {
        match self.writers.lock().get(name) {
            Some(Slot::Live(writer)) => Some(writer.clone()),
            _ => None,
        }
    }

    /// Drop the entry for `name` if it still belongs to writer `id`.
    pub(crate) fn remove(&self, name: &str, id: u64) -> bool {
        let mut writers = self.writers.lock();
        match writers.get(name) {
            Some(Slot::Live(current)) if current.id() == id => {
                writers.remove(name);
                true
            }
            _ => false,
        }
    }

    fn handles(&self) -> Vec<WriterHandle> {
        self.writers
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(writer) => Some(writer.clone()),
                Slot::Opening(_) => None,
            })
            .collect()
    }
}

/// Placeholder owned by the caller opening a store.
///
/// Dropping it without installing a writer clears the placeholder; either
/// way waiters are woken to resolve the name again.
struct OpeningGuard {
    table: Arc<WriterTable>,
    name: String,
    done: Arc<watch::Sender<bool>>,
}

impl OpeningGuard {
    /// Replace the placeholder with `writer` unless it already began retiring.
    fn install(&self, writer: &WriterHandle) {
        let mut writers = self.table.writers.lock();
        if writer.lifecycle() == Lifecycle::Active {
            writers.insert(self.name.clone(), Slot::Live(writer.clone()));
        }
    }
}

impl Drop for OpeningGuard {
    fn drop(&mut self) {
        {
            let mut writers = self.table.writers.lock();
            if matches!(writers.get(&self.name), Some(Slot::Opening(done)) if Arc::ptr_eq(done, &self.done)) {
                writers.remove(&self.name);
            }
        }
        self.done.send_replace(true);
    }
}

struct Inner<B: Backend> {
    config: Config,
    layout: StoreLayout,
    backend: Arc<B>,
    table: Arc<WriterTable>,
    next_id: AtomicU64,
}

/// Entry point for writing to and reading from named stores.
///
/// Cloning is cheap and every clone shares the same writers.
pub struct Registry<B: Backend = FileBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Registry<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Registry<FileBackend> {
    /// Registry over store files under `config.root`.
    pub fn new(config: Config) -> WriterResult<Self> {
        Self::with_backend(config, FileBackend)
    }
}

impl<B: Backend> Registry<B> {
    pub fn with_backend(config: Config, backend: B) -> WriterResult<Self> {
        config.validate()?;
        let layout = StoreLayout::new(config.root.clone(), config.extension.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                layout,
                backend: Arc::new(backend),
                table: Arc::new(WriterTable::default()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.inner.layout
    }

    fn path_for(&self, name: &str) -> WriterResult<PathBuf> {
        self.inner.layout.path_for(name)
    }

    /// The writer for `name`, starting one if none is registered.
    ///
    /// The flag is true when this call started the writer. The store must
    /// already exist; a missing store is an open error.
    pub async fn get_or_create(&self, name: &str) -> WriterResult<(WriterHandle, bool)> {
        let path = self.path_for(name)?;
        let compact_path = self.inner.layout.compact_path_for(name)?;

        let opening = loop {
            let mut pending = {
                let mut writers = self.inner.table.writers.lock();
                match writers.get(name) {
                    Some(Slot::Live(existing)) => return Ok((existing.clone(), false)),
                    Some(Slot::Opening(done)) => done.subscribe(),
                    None => {
                        let done = Arc::new(watch::channel(false).0);
                        writers.insert(name.to_string(), Slot::Opening(Arc::clone(&done)));
                        break OpeningGuard {
                            table: Arc::clone(&self.inner.table),
                            name: name.to_string(),
                            done,
                        };
                    }
                }
            };
            let _ = pending.wait_for(|done| *done).await;
        };

        let backend = Arc::clone(&self.inner.backend);
        let open_path = path.clone();
        let opened = tokio::task::spawn_blocking(move || backend.open(&open_path, false))
            .await
            .map_err(|e| WriterError::Spawn { name: name.to_string(), message: format!("open task: {}", e) })?;
        let handle = opened.map_err(|e| {
            warn!(store = name, path = %path.display(), error = %e, "Error opening store");
            e
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let spec = WriterSpec {
            id,
            name: name.to_string(),
            path,
            compact_path,
            handle,
            backend: Arc::clone(&self.inner.backend),
            table: Arc::clone(&self.inner.table),
        };
        let writer = writer::spawn(spec, &self.inner.config)?;
        opening.install(&writer);
        drop(opening);
        info!(store = name, id, "Opened writer");
        Ok((writer, true))
    }

    /// Hand `op` to the live writer for `name`, resolving again whenever a
    /// retiring writer refuses it.
    async fn submit(&self, name: &str, mut op: Op) -> WriterResult<(WriterHandle, bool)> {
        loop {
            let (writer, created) = self.get_or_create(name).await?;
            match writer.send(op).await {
                Ok(()) => return Ok((writer, created)),
                Err(refused) => {
                    debug!(store = name, id = writer.id(), "Writer retiring, resolving again");
                    op = refused;
                    writer.closed().await;
                }
            }
        }
    }

    /// Queue `value` under `key`. Waits while the writer's inbox is full.
    ///
    /// Keys and values the store cannot hold are rejected here, before they
    /// reach the writer.
    pub async fn store(&self, name: &str, key: impl Into<String>, value: impl Into<Vec<u8>>) -> WriterResult<()> {
        let (key, value) = (key.into(), value.into());
        check_sizes(key.as_bytes(), &value)?;
        self.submit(name, Op::Store { key, value }).await.map(|_| ())
    }

    /// Queue removal of `key`. Deleting a missing key is not an error.
    pub async fn delete(&self, name: &str, key: impl Into<String>) -> WriterResult<()> {
        let key = key.into();
        check_sizes(key.as_bytes(), &[])?;
        self.submit(name, Op::Delete { key }).await.map(|_| ())
    }

    /// Compact `name` after everything queued before this call is committed.
    ///
    /// A writer started just for the compaction is closed again afterwards.
    pub async fn compact(&self, name: &str) -> WriterResult<CompactionStats> {
        let (reply, outcome) = oneshot::channel();
        let (writer, created) = self.submit(name, Op::Compact { reply }).await?;
        let result = outcome
            .await
            .unwrap_or_else(|_| Err(WriterError::AlreadyClosed { name: name.to_string() }));

        if created {
            debug!(store = name, "Closing writer opened for compaction");
            if writer.request_close() {
                writer.closed().await;
            }
        }
        result
    }

    /// Retire the writer for `name`, returning once its store is released.
    ///
    /// Fails with `AlreadyClosed` when no writer is open or one is already
    /// retiring.
    pub async fn close(&self, name: &str) -> WriterResult<()> {
        let closed = || WriterError::AlreadyClosed { name: name.to_string() };
        let writer = self.inner.table.get(name).ok_or_else(closed)?;
        if !writer.request_close() {
            return Err(closed());
        }
        writer.closed().await;
        Ok(())
    }

    /// Retire every writer and wait for all of them.
    pub async fn shutdown(&self) {
        let writers = self.inner.table.handles();
        info!(writers = writers.len(), "Shutting down");
        for writer in &writers {
            writer.request_close();
        }
        for writer in &writers {
            writer.closed().await;
        }
    }

    /// Names of every store under the root, sorted.
    pub fn list_stores(&self) -> Vec<String> {
        self.inner.layout.list_stores()
    }

    /// Create an empty store. Existing stores are left as they are.
    pub fn create_store(&self, name: &str) -> WriterResult<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e, "create store directory"))?;
        }
        let handle = self.inner.backend.open(&path, true)?;
        handle.close()?;
        info!(store = name, path = %path.display(), "Created store");
        Ok(())
    }

    /// Close the writer for `name` if any, then delete the store file.
    ///
    /// Writes submitted while the drop is in progress may reopen the store
    /// before the file is removed; callers should quiesce the name first.
    pub async fn drop_store(&self, name: &str) -> WriterResult<()> {
        let path = self.path_for(name)?;
        if let Some(writer) = self.inner.table.get(name) {
            writer.request_close();
            writer.closed().await;
        }
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e, "remove store"))?;
        discard_compacted(&self.inner.layout.compact_path_for(name)?)?;
        info!(store = name, "Dropped store");
        Ok(())
    }

    /// True when a writer is registered for `name`, retiring or not.
    pub fn is_open(&self, name: &str) -> bool {
        self.inner.table.get(name).is_some()
    }

    /// Names with a registered writer, sorted.
    pub fn open_stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.table.handles().iter().map(|w| w.name().to_string()).collect();
        names.sort();
        names
    }

    pub fn writer_stats(&self, name: &str) -> Option<WriterStatsSnapshot> {
        self.inner.table.get(name).map(|writer| writer.stats())
    }

    /// Committed value of `key` in `name`. Writes still pending in a
    /// writer's batch are not visible.
    pub fn get(&self, name: &str, key: &str) -> WriterResult<Vec<u8>> {
        let path = self.path_for(name)?;
        read::get(&*self.inner.backend, &path, key)
    }

    /// Visit committed entries with `from <= key < to` in key order. An
    /// empty `to` means no upper bound.
    pub fn scan_range<F, E>(&self, name: &str, from: &str, to: &str, visit: F) -> Result<(), E>
    where
        F: FnMut(&str, &[u8]) -> Result<(), E>,
        E: From<WriterError>,
    {
        let path = self.path_for(name)?;
        read::scan_range(&*self.inner.backend, &path, from, to, visit)
    }

    /// Like `scan_range` but reads keys only.
    pub fn scan_keys<F, E>(&self, name: &str, from: &str, to: &str, visit: F) -> Result<(), E>
    where
        F: FnMut(&str) -> Result<(), E>,
        E: From<WriterError>,
    {
        let path = self.path_for(name)?;
        read::scan_keys(&*self.inner.backend, &path, from, to, visit)
    }
}

impl<B: Backend> std::fmt::Debug for Registry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.inner.config.root)
            .field("open", &self.open_stores())
            .finish()
    }
}
