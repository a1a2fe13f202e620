//! File-backed storage for Stashbox with encryption at rest.
//! Uses Argon2id + AES-GCM, a single JSON or YAML file per store, and an
//! advisory lock around every write.

pub mod cipher;
pub mod file_backend;
pub mod format;
pub mod options;
pub mod password;
pub mod read_only;

pub use options::{open, BackendKind, PasswordStore, StoreOptions};
