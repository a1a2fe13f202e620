use std::path::Path;

use serde::{Deserialize, Serialize};
use stashbox_core::{Format, Mapping, Result, StoreError};

/// On-disk serialization selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Json,
    Yaml,
}

impl FormatKind {
    /// `.yml`/`.yaml` files are YAML; everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml") => {
                FormatKind::Yaml
            }
            _ => FormatKind::Json,
        }
    }

    pub fn build(self) -> Box<dyn Format> {
        match self {
            FormatKind::Json => Box::new(JsonFormat),
            FormatKind::Yaml => Box::new(YamlFormat),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormat;

impl Format for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, mapping: &Mapping) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(mapping).map_err(StoreError::format)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Mapping> {
        if is_blank(bytes) {
            return Ok(Mapping::new());
        }
        let parsed: Option<Mapping> = serde_json::from_slice(bytes).map_err(StoreError::format)?;
        Ok(parsed.unwrap_or_default())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlFormat;

impl Format for YamlFormat {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, mapping: &Mapping) -> Result<Vec<u8>> {
        serde_yaml::to_string(mapping)
            .map(String::into_bytes)
            .map_err(StoreError::format)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Mapping> {
        if is_blank(bytes) {
            return Ok(Mapping::new());
        }
        let parsed: Option<Mapping> = serde_yaml::from_slice(bytes).map_err(StoreError::format)?;
        Ok(parsed.unwrap_or_default())
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}
