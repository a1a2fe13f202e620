use crate::{error::Result, storage::Mapping};

/// Serializer boundary for the on-disk mapping.
///
/// Implementations must decode empty (or whitespace-only) input, and a null
/// document, to an empty mapping.
pub trait Format: Send + Sync {
    /// Short name used for logging.
    fn name(&self) -> &'static str;

    fn encode(&self, mapping: &Mapping) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Mapping>;
}
