//! Writer — the write-behind loop that owns one store's handle.
//!
//! Each open store gets one writer running on its own thread. All
//! mutation of the store arrives as messages on a bounded inbox, so the
//! handle is only ever touched from that thread and needs no lock.
//!
//! The loop reacts to four things:
//! - **Operations**: stores and deletes join the pending batch; reaching
//!   the flush threshold commits it at once
//! - **Flush timer**: commits whatever is pending, bounding staleness
//! - **Idle tick**: retires the writer when nothing arrived since the
//!   previous tick and nothing is pending
//! - **Close requests**: retire on demand
//!
//! Compaction is just another message, so it is totally ordered with the
//! writes around it.
//!
//! Retirement closes the inbox first, then drains and applies every
//! message already accepted, flushes, closes the handle, and finally
//! deregisters. Submitters refused by a closed inbox wait for the writer
//! to finish and resolve the store again through the registry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tidepool_core::{discard_compacted, install_compacted, Bulk, CompactionStats, StoreError, StoreResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, StoreHandle};
use crate::config::Config;
use crate::error::{WriterError, WriterResult};
use crate::registry::WriterTable;

/// A message for a writer.
pub(crate) enum Op {
    Store { key: String, value: Vec<u8> },
    Delete { key: String },
    Compact { reply: oneshot::Sender<WriterResult<CompactionStats>> },
}

/// Where a writer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting and applying operations
    Active,
    /// Inbox closed; draining, flushing and releasing the store
    Retiring,
    /// Store released and writer removed from the registry
    Closed,
}

/// Counters shared between a writer and its handles.
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    accepted: AtomicU64,
    committed: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
    pending: AtomicU64,
}

impl WriterStats {
    fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a writer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatsSnapshot {
    /// Store and delete operations received
    pub accepted: u64,
    /// Operations committed to the store
    pub committed: u64,
    /// Successful batch commits
    pub flushes: u64,
    /// Successful compactions
    pub compactions: u64,
    /// Operations waiting in the current batch
    pub pending: u64,
}

/// Shared reference to a running writer.
///
/// Handles are cheap to clone. The registry hands them out per call;
/// callers should not keep one across calls.
#[derive(Clone)]
pub struct WriterHandle {
    id: u64,
    name: Arc<str>,
    inbox: mpsc::Sender<Op>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    stats: Arc<WriterStats>,
}

impl WriterHandle {
    /// Unique id of this writer instance; a recreated writer gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Enqueue `op`, waiting for inbox space. A retiring writer hands it back.
    pub(crate) async fn send(&self, op: Op) -> Result<(), Op> {
        self.inbox.send(op).await.map_err(|rejected| rejected.0)
    }

    /// Ask the writer to retire. False if it already is retiring or closed.
    pub(crate) fn request_close(&self) -> bool {
        self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Active {
                *state = Lifecycle::Retiring;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the writer has released its store and deregistered.
    pub(crate) async fn closed(&self) {
        let mut state = self.lifecycle.subscribe();
        let _ = state.wait_for(|s| *s == Lifecycle::Closed).await;
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Removes the writer from the registry and marks it closed when dropped,
/// whether the loop ended normally or by panic.
struct Registration {
    id: u64,
    name: Arc<str>,
    table: Arc<WriterTable>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.remove(&self.name, self.id);
        self.lifecycle.send_replace(Lifecycle::Closed);
    }
}

/// Writer state, owned by the writer thread.
struct Writer<B: Backend> {
    name: Arc<str>,
    backend: Arc<B>,
    handle: B::Handle,
    bulk: Bulk,
    path: PathBuf,
    compact_path: PathBuf,
    flush_threshold: usize,
    flush_interval: Duration,
    idle_interval: Duration,
    /// Messages received since the last idle tick
    live_ops: u64,
    stats: Arc<WriterStats>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

/// Everything needed to start a writer for one store.
pub(crate) struct WriterSpec<B: Backend> {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    pub compact_path: PathBuf,
    pub handle: B::Handle,
    pub backend: Arc<B>,
    pub table: Arc<WriterTable>,
}

/// Start a writer thread that owns `spec.handle`.
pub(crate) fn spawn<B: Backend>(spec: WriterSpec<B>, config: &Config) -> WriterResult<WriterHandle> {
    spawn_with(spec, config, |thread_name, body| {
        thread::Builder::new().name(thread_name).spawn(body).map(drop)
    })
}

/// Body run on a writer thread.
pub(crate) type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Like `spawn`, starting the thread through `start_thread`.
///
/// Nothing touches the registry until the thread is running. If it cannot
/// be started the store handle is closed here.
pub(crate) fn spawn_with<B, S>(spec: WriterSpec<B>, config: &Config, start_thread: S) -> WriterResult<WriterHandle>
where
    B: Backend,
    S: FnOnce(String, ThreadBody) -> std::io::Result<()>,
{
    let name: Arc<str> = Arc::from(spec.name.as_str());
    let spawn_error = |message: String| WriterError::Spawn { name: spec.name.clone(), message };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            close_unstarted(&name, spec.handle);
            return Err(spawn_error(format!("runtime: {}", e)));
        }
    };

    let (inbox_tx, inbox_rx) = mpsc::channel(config.queue_capacity);
    let lifecycle = Arc::new(watch::channel(Lifecycle::Active).0);
    let stats = Arc::new(WriterStats::default());

    let handle = WriterHandle {
        id: spec.id,
        name: Arc::clone(&name),
        inbox: inbox_tx,
        lifecycle: Arc::clone(&lifecycle),
        stats: Arc::clone(&stats),
    };

    let writer = Writer {
        name: Arc::clone(&name),
        bulk: spec.handle.bulk(),
        backend: spec.backend,
        handle: spec.handle,
        path: spec.path,
        compact_path: spec.compact_path,
        flush_threshold: config.flush_threshold,
        flush_interval: config.flush_interval,
        idle_interval: config.idle_interval,
        live_ops: 0,
        stats,
        lifecycle: Arc::clone(&lifecycle),
    };

    let (start_tx, start_rx) = oneshot::channel::<Writer<B>>();
    let (id, table, thread_store) = (spec.id, spec.table, Arc::clone(&name));
    let body: ThreadBody = Box::new(move || {
        let registration = Registration { id, name: thread_store, table, lifecycle };
        runtime.block_on(async move {
            if let Ok(writer) = start_rx.await {
                writer.run(inbox_rx, registration).await;
            }
        });
    });

    if let Err(e) = start_thread(format!("tidepool-{}", name), body) {
        writer.abandon();
        return Err(spawn_error(format!("thread: {}", e)));
    }
    if let Err(writer) = start_tx.send(writer) {
        writer.abandon();
        return Err(spawn_error("writer thread exited before start".to_string()));
    }
    Ok(handle)
}

fn close_unstarted<H: StoreHandle>(name: &str, handle: H) {
    if let Err(e) = handle.close() {
        warn!(store = name, error = %e, "Error closing store of unstarted writer");
    }
}

impl<B: Backend> Writer<B> {
    async fn run(mut self, mut inbox: mpsc::Receiver<Op>, registration: Registration) {
        let mut lifecycle = self.lifecycle.subscribe();

        let flush = tokio::time::sleep(self.flush_interval);
        tokio::pin!(flush);

        let mut idle = tokio::time::interval_at(Instant::now() + self.idle_interval, self.idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = lifecycle.changed() => {
                    if changed.is_err() || *lifecycle.borrow_and_update() != Lifecycle::Active {
                        break;
                    }
                }

                _ = idle.tick() => {
                    if self.bulk.is_empty() && self.live_ops == 0 {
                        info!(store = %self.name, "Closing idle writer");
                        self.lifecycle.send_replace(Lifecycle::Retiring);
                        break;
                    }
                    self.live_ops = 0;
                }

                _ = &mut flush => {
                    let _ = self.flush("timer");
                    flush.as_mut().reset(Instant::now() + self.flush_interval);
                }

                op = inbox.recv() => match op {
                    Some(op) => {
                        if self.apply(op) {
                            flush.as_mut().reset(Instant::now() + self.flush_interval);
                        }
                    }
                    None => break,
                },
            }
        }

        self.retire(inbox, registration).await;
    }

    /// Apply one message. Returns true when it triggered a threshold commit.
    fn apply(&mut self, op: Op) -> bool {
        self.live_ops += 1;
        match op {
            Op::Store { key, value } => self.bulk.set(key, value),
            Op::Delete { key } => self.bulk.delete(key),
            Op::Compact { reply } => {
                let outcome = self.compact();
                // The requester may have stopped waiting; the outcome is already logged.
                let _ = reply.send(outcome);
                return false;
            }
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.pending.store(self.bulk.len() as u64, Ordering::Relaxed);

        if self.bulk.len() >= self.flush_threshold {
            let _ = self.flush("threshold");
            return true;
        }
        false
    }

    /// Commit the pending batch. A failed commit keeps the batch for the next attempt.
    fn flush(&mut self, trigger: &'static str) -> StoreResult<usize> {
        if self.bulk.is_empty() {
            return Ok(0);
        }
        let start = std::time::Instant::now();
        let pending = self.bulk.len();

        match self.handle.commit(&mut self.bulk) {
            Ok(committed) => {
                self.stats.committed.fetch_add(committed as u64, Ordering::Relaxed);
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats.pending.store(self.bulk.len() as u64, Ordering::Relaxed);
                debug!(store = %self.name, items = committed, trigger, elapsed = ?start.elapsed(), "Flushed batch");
                Ok(committed)
            }
            Err(e) => {
                warn!(store = %self.name, pending, trigger, error = %e, "Commit failed, keeping batch for retry");
                Err(e)
            }
        }
    }

    fn compaction_error(&self, source: StoreError) -> WriterError {
        WriterError::Compaction { name: self.name.to_string(), source }
    }

    /// Compact the store in place. Failures leave the current handle in service.
    fn compact(&mut self) -> WriterResult<CompactionStats> {
        if !self.bulk.is_empty() {
            self.flush("pre-compact").map_err(|e| self.compaction_error(e))?;
        }
        self.bulk = self.handle.bulk();

        let start = std::time::Instant::now();
        let stats = match self.handle.compact_to(&self.compact_path) {
            Ok(stats) => stats,
            Err(e) => {
                error!(store = %self.name, error = %e, "Error compacting");
                self.discard_compact_output();
                self.bulk = self.handle.bulk();
                return Err(self.compaction_error(e));
            }
        };
        info!(
            store = %self.name,
            elapsed = ?start.elapsed(),
            live_entries = stats.live_entries,
            bytes_saved = stats.bytes_saved(),
            dead_space = stats.dead_space_ratio(),
            "Finished compaction"
        );

        if let Err(e) = install_compacted(&self.compact_path, &self.path) {
            error!(store = %self.name, error = %e, "Error putting compacted data back");
            self.discard_compact_output();
            self.bulk = self.handle.bulk();
            return Err(self.compaction_error(e));
        }

        debug!(store = %self.name, "Reopening post-compact");
        let reopened = match self.backend.open(&self.path, false) {
            Ok(handle) => handle,
            Err(e) => {
                // No usable handle remains for this store; continuing would lose writes.
                error!(store = %self.name, error = %e, "Error reopening store after compaction");
                std::process::abort();
            }
        };
        let stale = std::mem::replace(&mut self.handle, reopened);
        if let Err(e) = stale.close() {
            warn!(store = %self.name, error = %e, "Error closing pre-compaction handle");
        }
        self.bulk = self.handle.bulk();
        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(stats)
    }

    /// Release the store of a writer whose thread never ran.
    fn abandon(self) {
        close_unstarted(&self.name, self.handle);
    }

    fn discard_compact_output(&self) {
        if let Err(e) = discard_compacted(&self.compact_path) {
            warn!(store = %self.name, error = %e, "Could not remove compaction output");
        }
    }

    /// Stop accepting work, apply what was already accepted, release the store.
    async fn retire(mut self, mut inbox: mpsc::Receiver<Op>, registration: Registration) {
        self.lifecycle.send_replace(Lifecycle::Retiring);
        inbox.close();

        let mut drained = 0usize;
        while let Some(op) = inbox.recv().await {
            self.apply(op);
            drained += 1;
        }
        if drained > 0 {
            debug!(store = %self.name, drained, "Applied operations queued before close");
        }

        let pending = self.bulk.len();
        if self.flush("close").is_err() {
            error!(store = %self.name, lost = pending, "Final commit failed, dropping batch");
        }

        let Writer { name, handle, .. } = self;
        if let Err(e) = handle.close() {
            warn!(store = %name, error = %e, "Error closing store");
        }
        drop(registration);
        info!(store = %name, "Closed");
    }
}
