use std::collections::BTreeMap;

use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::{
    cipher::{Cipher, CipherFactory, CipherProvider, Password},
    error::{Result, StoreError},
    storage::{Backend, Mapping},
};

/// Password-protected key/value secret store.
///
/// Callers deal in plaintext; the backend only ever sees ciphertext. Keys are
/// plain strings and are compared exactly.
pub struct SecretStore<F: CipherFactory> {
    backend: Box<dyn Backend>,
    ciphers: CipherProvider<F>,
}

impl<F: CipherFactory> SecretStore<F> {
    pub fn new(backend: Box<dyn Backend>, factory: F, password: Password) -> Self {
        Self {
            backend,
            ciphers: CipherProvider::new(factory, password),
        }
    }

    /// Encrypt and add a new secret. Fails with `DuplicateKey` if `key` exists.
    /// Returns the plaintext that was stored.
    #[instrument(skip_all, fields(key = %key))]
    pub fn store(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.ciphers.cipher()?.encrypt(plaintext)?;
        self.backend.insert(key, sealed)?;
        Ok(plaintext.to_vec())
    }

    /// Encrypt and store, replacing any existing value for `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub fn store_overwrite(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.ciphers.cipher()?.encrypt(plaintext)?;
        self.backend.overwrite(key, sealed)?;
        Ok(plaintext.to_vec())
    }

    /// Decrypted value for `key`, or `None` when nothing is stored under it.
    #[instrument(skip_all, fields(key = %key))]
    pub fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.backend.get(key)? {
            Some(sealed) => Ok(Some(self.ciphers.cipher()?.decrypt(&sealed)?)),
            None => Ok(None),
        }
    }

    /// Like `fetch`, but a missing key is a `KeyNotFound` error.
    pub fn fetch_required(&self, key: &str) -> Result<Vec<u8>> {
        self.fetch(key)?.ok_or_else(|| StoreError::KeyNotFound {
            key: key.to_string(),
        })
    }

    /// Stored keys in sorted order.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.backend.keys()?.into_iter().collect())
    }

    /// Delete a secret. Returns whether anything was removed.
    #[instrument(skip_all, fields(key = %key))]
    pub fn remove(&self, key: &str) -> Result<bool> {
        if !self.backend.permits_writes() {
            return Err(StoreError::read_only("delete"));
        }
        Ok(self.backend.delete(key)?.is_some())
    }

    pub fn reload(&self) -> Result<bool> {
        self.backend.reload()
    }

    pub fn permits_writes(&self) -> bool {
        self.backend.permits_writes()
    }

    /// Re-encrypt every secret under `new_password`.
    ///
    /// All values are decrypted under the current password before anything is
    /// written; a single failure aborts with the store untouched. The new
    /// entries are handed to the backend as one batch that only lands if the
    /// store still holds exactly what was decrypted, so a concurrent writer's
    /// change yields `Conflict` instead of a resurrected or mixed-password
    /// store. Returns the number of secrets re-encrypted.
    #[instrument(skip_all)]
    pub fn change_password(&self, new_password: Password) -> Result<usize> {
        if !self.backend.permits_writes() {
            return Err(StoreError::read_only("change password"));
        }

        let current = self.ciphers.cipher()?;
        let mut sealed_now = Mapping::new();
        let mut opened: BTreeMap<String, Zeroizing<Vec<u8>>> = BTreeMap::new();
        for key in self.backend.keys()? {
            // A key may vanish between `keys` and `get` if another writer deletes it.
            if let Some(sealed) = self.backend.get(&key)? {
                opened.insert(key.clone(), Zeroizing::new(current.decrypt(&sealed)?));
                sealed_now.insert(key, sealed);
            }
        }
        debug!(entries = opened.len(), "decrypted store under current password");

        let next = self.ciphers.build(&new_password)?;
        let mut resealed = Mapping::new();
        for (key, plaintext) in &opened {
            resealed.insert(key.clone(), next.encrypt(plaintext)?);
        }

        let count = resealed.len();
        self.backend.replace_all(&sealed_now, resealed)?;
        self.ciphers.install(new_password, next)?;
        info!(entries = count, "password rotated");
        Ok(count)
    }
}
