use std::{collections::BTreeSet, path::Path};

use stashbox_core::{Backend, Ciphertext, Format, Mapping, Result, StoreError};
use tracing::debug;

use crate::file_backend::{FileBackend, Freshness};

/// Immutable snapshot of a store file.
///
/// The file is read once, at construction, and never again: later changes by
/// other writers are not observed. Every mutation fails with `ReadOnly`
/// without touching the disk.
pub struct ReadOnlyBackend {
    inner: FileBackend,
}

impl ReadOnlyBackend {
    pub fn open(path: impl AsRef<Path>, format: Box<dyn Format>) -> Result<Self> {
        let inner = FileBackend::new(path.as_ref(), format);
        let entries = inner.read_with(Freshness::Snapshot, Mapping::len)?;
        debug!(path = %inner.path().display(), entries, "opened read-only store snapshot");
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}

impl Backend for ReadOnlyBackend {
    fn get(&self, key: &str) -> Result<Option<Ciphertext>> {
        self.inner
            .read_with(Freshness::Snapshot, |mapping| mapping.get(key).cloned())
    }

    fn keys(&self) -> Result<BTreeSet<String>> {
        self.inner
            .read_with(Freshness::Snapshot, |mapping| mapping.keys().cloned().collect())
    }

    fn insert(&self, _key: &str, _value: Ciphertext) -> Result<Ciphertext> {
        Err(StoreError::read_only("insert"))
    }

    fn overwrite(&self, _key: &str, _value: Ciphertext) -> Result<Ciphertext> {
        Err(StoreError::read_only("overwrite"))
    }

    fn replace_all(&self, _expected: &Mapping, _entries: Mapping) -> Result<()> {
        Err(StoreError::read_only("replace entries"))
    }

    fn delete(&self, _key: &str) -> Result<Option<Ciphertext>> {
        Err(StoreError::read_only("delete"))
    }

    /// The snapshot is fixed for the life of the handle; nothing is re-read.
    fn reload(&self) -> Result<bool> {
        Ok(false)
    }

    fn permits_writes(&self) -> bool {
        false
    }
}
