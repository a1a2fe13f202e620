use std::sync::{Arc, Mutex};

use stashbox_core::{Password, Result, StoreError};
use tracing::debug;

/// Where the store password comes from (environment, OS keychain, memory in tests).
pub trait PasswordSource: Send + Sync {
    /// Short name used for logging and error messages.
    fn name(&self) -> &'static str;

    fn password(&self) -> Result<Password>;

    /// Remember a new password after a rotation. Sources that cannot persist
    /// refuse.
    fn remember(&self, _password: &Password) -> Result<()> {
        Err(StoreError::Password {
            reason: format!("{} source cannot store a password", self.name()),
        })
    }
}

/// Reads the password from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvPasswordSource {
    var: String,
}

impl EnvPasswordSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl PasswordSource for EnvPasswordSource {
    fn name(&self) -> &'static str {
        "env"
    }

    fn password(&self) -> Result<Password> {
        match std::env::var(&self.var) {
            Ok(value) if !value.is_empty() => Ok(Password::new(value)),
            Ok(_) => Err(StoreError::Password {
                reason: format!("{} is empty", self.var),
            }),
            Err(err) => Err(StoreError::Password {
                reason: format!("{}: {err}", self.var),
            }),
        }
    }
}

/// OS keyring-backed source: macOS Keychain, Windows Credential Manager, or
/// the Linux kernel keyring, as enabled through `keyring` platform features.
pub struct KeyringPasswordSource {
    service: String,
    account: String,
}

impl KeyringPasswordSource {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account).map_err(keyring_err)
    }
}

impl PasswordSource for KeyringPasswordSource {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn password(&self) -> Result<Password> {
        let secret = self.entry()?.get_password().map_err(keyring_err)?;
        Ok(Password::new(secret))
    }

    fn remember(&self, password: &Password) -> Result<()> {
        self.entry()?
            .set_password(password.expose())
            .map_err(keyring_err)?;
        debug!(service = %self.service, account = %self.account, "stored password in keyring");
        Ok(())
    }
}

/// In-memory source for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPasswordSource {
    inner: Arc<Mutex<Option<Password>>>,
}

impl InMemoryPasswordSource {
    pub fn new(password: impl Into<Password>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(password.into()))),
        }
    }
}

impl PasswordSource for InMemoryPasswordSource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn password(&self) -> Result<Password> {
        let guard = self
            .inner
            .lock()
            .map_err(|err| StoreError::poisoned("password source", err))?;
        guard.clone().ok_or_else(|| StoreError::Password {
            reason: "no password set".to_string(),
        })
    }

    fn remember(&self, password: &Password) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| StoreError::poisoned("password source", err))?;
        *guard = Some(password.clone());
        Ok(())
    }
}

fn keyring_err(err: keyring::Error) -> StoreError {
    StoreError::Password {
        reason: format!("keyring error: {err}"),
    }
}
