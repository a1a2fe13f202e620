use std::path::PathBuf;

use color_eyre::Result;
use stashbox_core::{Password, StoreError};
use stashbox_storage::{
    format::FormatKind,
    open,
    password::{EnvPasswordSource, KeyringPasswordSource, PasswordSource},
    BackendKind, PasswordStore, StoreOptions,
};
use tracing::debug;

use crate::{
    cli::Cli,
    config::{Config, PasswordConfig, PasswordSourceKind},
};

/// Store location and mode after applying CLI overrides to the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: PathBuf,
    pub format: Option<FormatKind>,
    pub backend: BackendKind,
}

impl Target {
    pub fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let path = match &cli.file {
            Some(path) => path.clone(),
            None => config.resolve_store_path()?,
        };
        let backend = if cli.read_only || config.read_only {
            BackendKind::ReadOnly
        } else {
            BackendKind::Mutable
        };
        Ok(Self {
            path,
            format: cli.format.map(FormatKind::from).or(config.format),
            backend,
        })
    }
}

/// Open the store described by `target` with `password`.
pub fn open_store(target: &Target, config: &Config, password: Password) -> Result<PasswordStore> {
    debug!(path = %target.path.display(), backend = ?target.backend, "opening store");
    let mut options = StoreOptions::new(&target.path, password)
        .backend(target.backend)
        .kdf(config.kdf);
    if let Some(format) = target.format {
        options = options.format(format);
    }
    Ok(open(options)?)
}

/// Terminal prompt, used directly or when the environment variable is unset.
pub struct PromptPasswordSource {
    prompt: String,
}

impl PromptPasswordSource {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl PasswordSource for PromptPasswordSource {
    fn name(&self) -> &'static str {
        "prompt"
    }

    fn password(&self) -> Result<Password, StoreError> {
        let secret =
            rpassword::prompt_password(&self.prompt).map_err(|e| StoreError::Password {
                reason: format!("password prompt: {e}"),
            })?;
        Ok(Password::new(secret))
    }
}

/// Environment variable first, terminal prompt if it is unset.
pub struct EnvOrPrompt {
    env: EnvPasswordSource,
    prompt: PromptPasswordSource,
}

impl PasswordSource for EnvOrPrompt {
    fn name(&self) -> &'static str {
        "env"
    }

    fn password(&self) -> Result<Password, StoreError> {
        match self.env.password() {
            Ok(password) => Ok(password),
            Err(err) => {
                debug!("falling back to prompt: {err}");
                self.prompt.password()
            }
        }
    }
}

/// Build the configured password source.
pub fn password_source(config: &PasswordConfig) -> Box<dyn PasswordSource> {
    let prompt = PromptPasswordSource::new("Store password: ");
    match config.source {
        PasswordSourceKind::Env => Box::new(EnvOrPrompt {
            env: EnvPasswordSource::new(&config.env_var),
            prompt,
        }),
        PasswordSourceKind::Keyring => Box::new(KeyringPasswordSource::new(
            &config.keyring_service,
            &config.keyring_account,
        )),
        PasswordSourceKind::Prompt => Box::new(prompt),
    }
}
