use std::{
    fs, io,
    path::{Path, PathBuf},
};

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use stashbox_storage::{cipher::KdfParams, format::FormatKind};

/// User-level configuration loaded from `~/.config/stashbox/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Store file; defaults to `secrets.json` under the platform data dir.
    pub store_path: Option<PathBuf>,
    /// Serialization; inferred from the file extension when unset.
    pub format: Option<FormatKind>,
    /// Open the store read-only.
    pub read_only: bool,
    /// Argon2id cost.
    pub kdf: KdfParams,
    pub password: PasswordConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PasswordSourceKind {
    /// Environment variable, prompting when it is unset.
    #[default]
    Env,
    Keyring,
    Prompt,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PasswordConfig {
    pub source: PasswordSourceKind,
    pub env_var: String,
    pub keyring_service: String,
    pub keyring_account: String,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            source: PasswordSourceKind::Env,
            env_var: "STASHBOX_PASSWORD".to_string(),
            keyring_service: "stashbox".to_string(),
            keyring_account: "store-password".to_string(),
        }
    }
}

impl Config {
    /// Store file to use, falling back to the platform data dir.
    pub fn resolve_store_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.store_path {
            return Ok(path.clone());
        }
        let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
        Ok(base.join("stashbox").join("secrets.json"))
    }
}

/// Settings from `<config_dir>/stashbox/config.toml`; an absent file means
/// stashbox runs on defaults (env password, JSON store in the data dir).
pub fn load() -> Result<Config> {
    load_from_path(default_path()?)
}

/// Parse the config at `path`. Missing and blank files both yield defaults so
/// `config init` is optional; a malformed file is an error naming the path.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(err) => return Err(err).wrap_err_with(|| format!("reading {}", path.display())),
    };
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    toml::from_str(&contents).wrap_err_with(|| format!("parsing {}", path.display()))
}

/// `stashbox/config.toml` under the platform config dir.
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| eyre!("no config dir available"))?;
    Ok(base.join("stashbox").join("config.toml"))
}

/// Write the given config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
