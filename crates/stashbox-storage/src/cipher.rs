use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use stashbox_core::{Cipher, CipherFactory, Ciphertext, Password, Result, StoreError};
use zeroize::Zeroizing;

const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

type Salt = [u8; SALT_LEN];
type Key = Zeroizing<[u8; KEY_LEN]>;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| StoreError::cipher(format!("argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Builds AES-256-GCM ciphers keyed by Argon2id over the store password.
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2AesFactory {
    params: KdfParams,
}

impl Argon2AesFactory {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }
}

impl CipherFactory for Argon2AesFactory {
    type Cipher = Argon2AesCipher;

    fn build(&self, password: &Password) -> Result<Argon2AesCipher> {
        let argon = self.params.argon2()?;
        let mut salt: Salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Ok(Argon2AesCipher {
            argon,
            password: password.clone(),
            salt,
            keys: Mutex::new(HashMap::new()),
        })
    }
}

/// AES-256-GCM cipher for one password.
///
/// Text form of a ciphertext, URL-safe base64 without padding:
/// `version(1) | salt(16) | nonce(12) | sealed payload + tag`.
/// New ciphertexts all use this handle's salt, so one derivation serves every
/// write. Keys are derived per salt on first use and kept, so a handle that
/// only reads never pays for its own write key.
pub struct Argon2AesCipher {
    argon: Argon2<'static>,
    password: Password,
    salt: Salt,
    keys: Mutex<HashMap<Salt, Key>>,
}

impl Argon2AesCipher {
    fn with_key_for<R>(&self, salt: &Salt, use_key: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let mut keys = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !keys.contains_key(salt) {
            let key = derive_key(&self.argon, &self.password, salt)?;
            keys.insert(*salt, key);
        }
        match keys.get(salt) {
            Some(key) => use_key(key.as_slice()),
            None => Err(StoreError::cipher("derived key went missing")),
        }
    }
}

impl Cipher for Argon2AesCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Ciphertext> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self.with_key_for(&self.salt, |key| {
            Aes256Gcm::new_from_slice(key)
                .map_err(|e| StoreError::cipher(format!("cipher init failed: {e}")))?
                .encrypt(&nonce, plaintext)
                .map_err(|e| StoreError::cipher(format!("encrypt failed: {e}")))
        })?;

        let mut blob = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + sealed.len());
        blob.push(FORMAT_VERSION);
        blob.extend_from_slice(&self.salt);
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&sealed);
        Ok(Ciphertext::new(URL_SAFE_NO_PAD.encode(blob)))
    }

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
        let blob = URL_SAFE_NO_PAD
            .decode(ciphertext.as_str())
            .map_err(|e| decryption(format!("ciphertext decode failed: {e}")))?;
        if blob.len() < 1 + SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(decryption("ciphertext too short"));
        }
        let (version, rest) = blob.split_at(1);
        if version[0] != FORMAT_VERSION {
            return Err(decryption(format!(
                "unsupported ciphertext version {}",
                version[0]
            )));
        }
        let (salt, rest) = rest.split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let salt: Salt = salt
            .try_into()
            .map_err(|_| decryption("malformed salt"))?;

        self.with_key_for(&salt, |key| {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| StoreError::cipher(format!("cipher init failed: {e}")))?;
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| decryption("wrong password or corrupted ciphertext"))
        })
    }
}

fn derive_key(argon: &Argon2<'_>, password: &Password, salt: &Salt) -> Result<Key> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(password.expose().as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| StoreError::cipher(format!("argon2 derive: {e}")))?;
    Ok(key)
}

fn decryption(reason: impl Into<String>) -> StoreError {
    StoreError::Decryption {
        reason: reason.into(),
    }
}
