//! Store capabilities consumed by writers and the read path.
//!
//! Writers never depend on a concrete store: they open handles through a
//! `Backend` and drive them through `StoreHandle`. `FileBackend` plugs in
//! `tidepool_core::Store`.

use std::ops::ControlFlow;
use std::path::Path;

use tidepool_core::{Bulk, CompactionStats, Store, StoreResult};

/// Opens store handles.
pub trait Backend: Send + Sync + 'static {
    type Handle: StoreHandle;

    /// Open the store at `path`; `create` makes a missing store instead of failing.
    fn open(&self, path: &Path, create: bool) -> StoreResult<Self::Handle>;
}

/// Operations on one open store.
pub trait StoreHandle: Send + 'static {
    /// Value for `key`, or `KeyNotFound`.
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Ordered walk of entries starting at the first key >= `from`.
    fn walk(
        &self,
        from: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()>;

    /// Ordered walk of keys starting at the first key >= `from`.
    fn walk_keys(
        &self,
        from: &str,
        visit: &mut dyn FnMut(&str) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()>;

    /// Fresh batch context.
    fn bulk(&self) -> Bulk {
        Bulk::new()
    }

    /// Apply `bulk`, emptying it on success. Returns the operations applied.
    fn commit(&mut self, bulk: &mut Bulk) -> StoreResult<usize>;

    /// Write a compacted copy of the store to `dest`.
    fn compact_to(&self, dest: &Path) -> StoreResult<CompactionStats>;

    /// Release the handle.
    fn close(self) -> StoreResult<()>
    where
        Self: Sized;
}

/// Backend over `tidepool_core::Store` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBackend;

impl Backend for FileBackend {
    type Handle = Store;

    fn open(&self, path: &Path, create: bool) -> StoreResult<Store> {
        Store::open(path, create)
    }
}

impl StoreHandle for Store {
    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        Store::get(self, key)
    }

    fn walk(
        &self,
        from: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()> {
        Store::walk(self, from, visit)
    }

    fn walk_keys(
        &self,
        from: &str,
        visit: &mut dyn FnMut(&str) -> StoreResult<ControlFlow<()>>,
    ) -> StoreResult<()> {
        Store::walk_keys(self, from, visit)
    }

    fn bulk(&self) -> Bulk {
        Store::bulk(self)
    }

    fn commit(&mut self, bulk: &mut Bulk) -> StoreResult<usize> {
        Store::commit(self, bulk)
    }

    fn compact_to(&self, dest: &Path) -> StoreResult<CompactionStats> {
        Store::compact_to(self, dest)
    }

    fn close(self) -> StoreResult<()> {
        Store::close(self)
    }
}
