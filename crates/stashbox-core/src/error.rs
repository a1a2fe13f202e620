use std::path::Path;

use thiserror::Error;

/// Errors produced by backends, ciphers, and the secret store facade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// `insert`/`store` found the key already present.
    #[error("key already stored: {key}")]
    DuplicateKey { key: String },
    /// A required key was absent.
    #[error("no secret stored for key: {key}")]
    KeyNotFound { key: String },
    /// Ciphertext could not be opened (wrong password or corrupted data).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },
    /// A mutation was attempted against an immutable view.
    #[error("store is read-only, refusing to {operation}")]
    ReadOnly { operation: String },
    /// The store changed under a multi-step operation, which was abandoned
    /// before writing anything.
    #[error("store changed concurrently: {reason}")]
    Conflict { reason: String },
    /// Reading, writing, or locking the backing file failed.
    #[error("i/o failure on {path}: {reason}")]
    Io { path: String, reason: String },
    /// The backing file could not be encoded or decoded.
    #[error("format failure: {reason}")]
    Format { reason: String },
    /// Key derivation or encryption failed.
    #[error("cipher failure: {reason}")]
    Cipher { reason: String },
    /// No password could be obtained from the configured source.
    #[error("password unavailable: {reason}")]
    Password { reason: String },
    /// An in-process mutex was poisoned by a panicking thread.
    #[error("{resource} lock poisoned: {reason}")]
    Poisoned { resource: String, reason: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

impl StoreError {
    /// Returns a mapper that tags an I/O error with the path it happened on.
    pub fn io<E: ToString>(path: &Path) -> impl FnOnce(E) -> StoreError + '_ {
        move |err| StoreError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn format<E: ToString>(err: E) -> StoreError {
        StoreError::Format {
            reason: err.to_string(),
        }
    }

    pub fn cipher<E: ToString>(err: E) -> StoreError {
        StoreError::Cipher {
            reason: err.to_string(),
        }
    }

    pub fn read_only(operation: &str) -> StoreError {
        StoreError::ReadOnly {
            operation: operation.to_string(),
        }
    }

    pub fn poisoned<E: ToString>(resource: &str, err: E) -> StoreError {
        StoreError::Poisoned {
            resource: resource.to_string(),
            reason: err.to_string(),
        }
    }
}
