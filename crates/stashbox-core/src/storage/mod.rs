//! Storage contracts: the key/ciphertext mapping, the `Backend` capability,
//! and the serializer boundary used to persist the mapping.

mod backend;
mod format;

pub use backend::{ensure_unchanged, Backend, Ciphertext, Mapping, MemoryBackend};
pub use format::Format;
