use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stashbox_storage::format::FormatKind;

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "stashbox",
    about = "Password-protected single-file secret store",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Store file to use instead of the configured one.
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,
    /// Store file format (defaults to the config, then the file extension).
    #[arg(long, global = true, value_enum)]
    pub format: Option<FormatArg>,
    /// Open the store read-only; every write is refused.
    #[arg(long, global = true)]
    pub read_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a secret. Reads the value from stdin when it is not given.
    Put {
        key: String,
        value: Option<String>,
        /// Replace an existing value instead of failing.
        #[arg(short, long)]
        force: bool,
    },
    /// Print a secret.
    Get { key: String },
    /// List stored keys.
    List,
    /// Delete a secret.
    Rm { key: String },
    /// Re-encrypt every secret under a new password.
    Passwd {
        /// Read the new password from this environment variable instead of prompting.
        #[arg(long)]
        new_password_env: Option<String>,
    },
    /// Check that encryption and the store file work.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Json,
    Yaml,
}

impl From<FormatArg> for FormatKind {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => FormatKind::Json,
            FormatArg::Yaml => FormatKind::Yaml,
        }
    }
}
