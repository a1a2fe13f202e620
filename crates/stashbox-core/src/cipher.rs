use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use zeroize::Zeroizing;

use crate::{
    error::{Result, StoreError},
    storage::Ciphertext,
};

/// Store password. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(Zeroizing<String>);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Symmetric encryption capability bound to one password.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Ciphertext>;

    /// Fails with `StoreError::Decryption` on a wrong password or corrupted input.
    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>>;
}

/// Builds a `Cipher` from a password (key derivation lives here).
pub trait CipherFactory: Send + Sync {
    type Cipher: Cipher;

    fn build(&self, password: &Password) -> Result<Self::Cipher>;
}

struct ProviderState<C> {
    password: Password,
    cipher: Option<Arc<C>>,
}

/// Holds the current password and lazily builds, then reuses, its cipher.
///
/// Key derivation is expensive, so the handle is built on first use and kept
/// until the password changes.
pub struct CipherProvider<F: CipherFactory> {
    factory: F,
    state: Mutex<ProviderState<F::Cipher>>,
}

impl<F: CipherFactory> CipherProvider<F> {
    pub fn new(factory: F, password: Password) -> Self {
        Self {
            factory,
            state: Mutex::new(ProviderState {
                password,
                cipher: None,
            }),
        }
    }

    /// Cipher for the current password, built on first call.
    pub fn cipher(&self) -> Result<Arc<F::Cipher>> {
        let mut state = self.lock()?;
        if let Some(cipher) = &state.cipher {
            return Ok(Arc::clone(cipher));
        }
        let cipher = Arc::new(self.factory.build(&state.password)?);
        state.cipher = Some(Arc::clone(&cipher));
        Ok(cipher)
    }

    /// Switch passwords. Stored data is untouched; the cached cipher is dropped.
    pub fn set_password(&self, password: Password) -> Result<()> {
        let mut state = self.lock()?;
        state.password = password;
        state.cipher = None;
        Ok(())
    }

    /// Build a cipher for `password` without switching to it.
    pub fn build(&self, password: &Password) -> Result<F::Cipher> {
        self.factory.build(password)
    }

    /// Switch to `password` and adopt an already-built cipher for it.
    pub fn install(&self, password: Password, cipher: F::Cipher) -> Result<()> {
        let mut state = self.lock()?;
        state.password = password;
        state.cipher = Some(Arc::new(cipher));
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProviderState<F::Cipher>>> {
        self.state
            .lock()
            .map_err(|err| StoreError::poisoned("cipher provider", err))
    }
}

/// XOR-mask "cipher" for tests and smoke runs. Not cryptographically secure.
///
/// Ciphertexts carry a fingerprint of the password so that opening one with a
/// different password fails as a decryption error, as a real AEAD would.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskCipherFactory;

pub struct MaskCipher {
    pad: Zeroizing<Vec<u8>>,
    fingerprint: [u8; 8],
}

const MASK_BYTE: u8 = 0xA5;

impl CipherFactory for MaskCipherFactory {
    type Cipher = MaskCipher;

    fn build(&self, password: &Password) -> Result<MaskCipher> {
        Ok(MaskCipher {
            pad: Zeroizing::new(password.expose().as_bytes().to_vec()),
            fingerprint: fingerprint(password.expose().as_bytes()),
        })
    }
}

impl MaskCipher {
    fn mask(&self, input: &[u8]) -> Vec<u8> {
        input
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let pad = self.pad.get(i % self.pad.len().max(1)).copied();
                b ^ MASK_BYTE ^ pad.unwrap_or(0)
            })
            .collect()
    }
}

impl Cipher for MaskCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Ciphertext> {
        let mut blob = self.fingerprint.to_vec();
        blob.extend(self.mask(plaintext));
        Ok(Ciphertext::new(URL_SAFE_NO_PAD.encode(blob)))
    }

    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Vec<u8>> {
        let blob = URL_SAFE_NO_PAD
            .decode(ciphertext.as_str())
            .map_err(|e| StoreError::Decryption {
                reason: format!("malformed ciphertext: {e}"),
            })?;
        match blob.split_at_checked(self.fingerprint.len()) {
            Some((tag, body)) if tag == self.fingerprint => Ok(self.mask(body)),
            _ => Err(StoreError::Decryption {
                reason: "wrong password or corrupted ciphertext".to_string(),
            }),
        }
    }
}

// FNV-1a; only needs to tell passwords apart in tests.
fn fingerprint(bytes: &[u8]) -> [u8; 8] {
    let hash = bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
        (acc ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    });
    hash.to_be_bytes()
}
