use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stashbox_core::{Backend, Password, Result, SecretStore};
use tracing::{debug, instrument};

use crate::{
    cipher::{Argon2AesFactory, KdfParams},
    file_backend::FileBackend,
    format::FormatKind,
    read_only::ReadOnlyBackend,
};

/// Secret store over a file, encrypted with Argon2id + AES-GCM.
pub type PasswordStore = SecretStore<Argon2AesFactory>;

/// Which backend variant a store is opened with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Mutable,
    ReadOnly,
}

/// Construction options for [`open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    path: PathBuf,
    password: Password,
    backend: BackendKind,
    format: Option<FormatKind>,
    kdf: KdfParams,
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>, password: impl Into<Password>) -> Self {
        Self {
            path: path.into(),
            password: password.into(),
            backend: BackendKind::default(),
            format: None,
            kdf: KdfParams::default(),
        }
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn read_only(self) -> Self {
        self.backend(BackendKind::ReadOnly)
    }

    /// Defaults to inferring the format from the file extension.
    pub fn format(mut self, format: FormatKind) -> Self {
        self.format = Some(format);
        self
    }

    pub fn kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }
}

/// Open a store. The mutable backend does no I/O until first use; the
/// read-only backend takes its snapshot here.
#[instrument(skip_all, fields(path = %options.path.display(), backend = ?options.backend))]
pub fn open(options: StoreOptions) -> Result<PasswordStore> {
    let format = options
        .format
        .unwrap_or_else(|| FormatKind::from_path(&options.path))
        .build();
    debug!(format = format.name(), "opening secret store");

    let backend: Box<dyn Backend> = match options.backend {
        BackendKind::Mutable => Box::new(FileBackend::new(options.path, format)),
        BackendKind::ReadOnly => Box::new(ReadOnlyBackend::open(&options.path, format)?),
    };
    Ok(SecretStore::new(
        backend,
        Argon2AesFactory::new(options.kdf),
        options.password,
    ))
}
