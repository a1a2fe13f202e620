//! Core abstractions for Stashbox: the backend and cipher contracts, and the
//! `SecretStore` facade that ties them together.
//! No file or crypto dependencies live here; see `stashbox-storage` for those.

pub mod cipher;
pub mod error;
pub mod storage;
pub mod store;

pub use cipher::{Cipher, CipherFactory, CipherProvider, Password};
pub use error::{Result, StoreError};
pub use storage::{ensure_unchanged, Backend, Ciphertext, Format, Mapping};
pub use store::SecretStore;
