use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Armored ciphertext as persisted in the store file. Opaque to backends.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(String);

impl Ciphertext {
    pub fn new(armored: impl Into<String>) -> Self {
        Self(armored.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ciphertext({} chars)", self.0.len())
    }
}

/// The whole store: key -> ciphertext. Order carries no meaning.
pub type Mapping = BTreeMap<String, Ciphertext>;

/// Key/ciphertext persistence used by the `SecretStore` facade.
///
/// Keys are canonical strings; callers holding other identifier types must
/// convert them before calling in, so `"foo"` and an identifier `foo` address
/// the same entry. Backends never see plaintext.
pub trait Backend: Send + Sync {
    /// Look up a key. A missing backing file reads as an empty store.
    fn get(&self, key: &str) -> Result<Option<Ciphertext>>;

    fn keys(&self) -> Result<BTreeSet<String>>;

    /// Add a new entry; fails with `DuplicateKey` if the key exists.
    fn insert(&self, key: &str, value: Ciphertext) -> Result<Ciphertext>;

    /// Replace-or-create.
    fn overwrite(&self, key: &str, value: Ciphertext) -> Result<Ciphertext>;

    /// Make the store hold exactly `entries`, provided it still holds exactly
    /// `expected`; otherwise fail with `Conflict` and write nothing.
    ///
    /// Backends that can should check and persist under one lock in a single
    /// write. This default compares through `keys`/`get` and then applies the
    /// entries one at a time, so it only suits single-writer backends.
    fn replace_all(&self, expected: &Mapping, entries: Mapping) -> Result<()> {
        let mut current = Mapping::new();
        for key in self.keys()? {
            if let Some(value) = self.get(&key)? {
                current.insert(key, value);
            }
        }
        ensure_unchanged(expected, &current)?;
        for key in current.keys().filter(|key| !entries.contains_key(*key)) {
            self.delete(key)?;
        }
        for (key, value) in entries {
            self.overwrite(&key, value)?;
        }
        Ok(())
    }

    /// Remove a key, returning its prior value. Absent keys cause no I/O.
    fn delete(&self, key: &str) -> Result<Option<Ciphertext>>;

    /// Drop any cached state and re-read. Returns whether a reload happened.
    fn reload(&self) -> Result<bool>;

    fn permits_writes(&self) -> bool;
}

/// Fails with `Conflict` unless `current` still holds exactly `expected`.
pub fn ensure_unchanged(expected: &Mapping, current: &Mapping) -> Result<()> {
    if expected == current {
        return Ok(());
    }
    let changed = expected
        .keys()
        .chain(current.keys())
        .find(|key| expected.get(*key) != current.get(*key));
    let reason = match changed {
        Some(key) if !expected.contains_key(key) => format!("`{key}` was added by another writer"),
        Some(key) if !current.contains_key(key) => format!("`{key}` was removed by another writer"),
        Some(key) => format!("`{key}` was rewritten by another writer"),
        None => "contents differ from the last read".to_string(),
    };
    Err(StoreError::Conflict { reason })
}

/// In-memory backend for tests and smoke runs. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Mapping>>,
    read_only: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frozen view over `entries`; every mutation fails with `ReadOnly`.
    pub fn read_only(entries: Mapping) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entries)),
            read_only: true,
        }
    }

    /// Copy of the current contents, as a file dump would show them.
    pub fn entries(&self) -> Result<Mapping> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Mapping>> {
        self.inner
            .lock()
            .map_err(|err| StoreError::poisoned("memory backend", err))
    }

    fn writable(&self, operation: &str) -> Result<MutexGuard<'_, Mapping>> {
        if self.read_only {
            return Err(StoreError::read_only(operation));
        }
        self.lock()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Ciphertext>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn keys(&self) -> Result<BTreeSet<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn insert(&self, key: &str, value: Ciphertext) -> Result<Ciphertext> {
        let mut map = self.writable("insert")?;
        if map.contains_key(key) {
            return Err(StoreError::DuplicateKey {
                key: key.to_string(),
            });
        }
        map.insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn overwrite(&self, key: &str, value: Ciphertext) -> Result<Ciphertext> {
        let mut map = self.writable("overwrite")?;
        map.insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn replace_all(&self, expected: &Mapping, entries: Mapping) -> Result<()> {
        let mut map = self.writable("replace entries")?;
        ensure_unchanged(expected, &map)?;
        *map = entries;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<Option<Ciphertext>> {
        let mut map = self.writable("delete")?;
        Ok(map.remove(key))
    }

    fn reload(&self) -> Result<bool> {
        Ok(!self.read_only)
    }

    fn permits_writes(&self) -> bool {
        !self.read_only
    }
}
