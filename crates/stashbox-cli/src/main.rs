mod cli;
mod config;
mod secrets;
mod storage;

use std::io::{self, IsTerminal};

use clap::Parser;
use color_eyre::Result;
use stashbox_core::{Password, SecretStore};
use stashbox_storage::{
    cipher::Argon2AesFactory,
    file_backend::FileBackend,
    format::FormatKind,
    read_only::ReadOnlyBackend,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    cli::{Command, ConfigCommand},
    config::PasswordSourceKind,
    storage::Target,
};

/// Entry point wiring the CLI to the secret store.
fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match &cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Health => run_health_check(&cli, &config)?,
        command => run_secret_command(command, &cli, &config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Secrets go to stdout; keep logs on stderr and quiet by default.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("stashbox {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn run_secret_command(command: &Command, cli: &cli::Cli, config: &config::Config) -> Result<()> {
    let target = Target::resolve(cli, config)?;
    let source = storage::password_source(&config.password);
    let store = storage::open_store(&target, config, source.password()?)?;
    let mut stdout = io::stdout().lock();
    let terminal = stdout.is_terminal();

    match command {
        Command::Put { key, value, force } => secrets::put(&store, key, value.clone(), *force)?,
        Command::Get { key } => secrets::get(&store, key, &mut stdout, terminal)?,
        Command::List => secrets::list(&store, &mut stdout)?,
        Command::Rm { key } => secrets::remove(&store, key)?,
        Command::Passwd { new_password_env } => {
            let next = secrets::new_password(new_password_env.as_deref())?;
            let count = secrets::rotate(&store, next.clone())?;
            if config.password.source == PasswordSourceKind::Keyring {
                if let Err(err) = source.remember(&next) {
                    warn!("password rotated but keyring update failed: {err}");
                }
            }
            println!("Re-encrypted {count} secret(s).");
        }
        Command::Version | Command::Health | Command::Config(_) => {}
    }
    Ok(())
}

/// Round-trips a canary secret through a scratch store, then checks the real store
/// file can be read.
fn run_health_check(cli: &cli::Cli, config: &config::Config) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    run_cipher_health(&scratch.path().join("canary.json"), config)?;
    println!("Encryption: ok");

    let target = Target::resolve(cli, config)?;
    let format = target
        .format
        .unwrap_or_else(|| FormatKind::from_path(&target.path))
        .build();
    let snapshot = ReadOnlyBackend::open(&target.path, format)?;
    let count = stashbox_core::Backend::keys(&snapshot)?.len();
    info!(path = %target.path.display(), count, "store file readable");
    println!("Store: ok ({}, {count} secret(s))", target.path.display());
    Ok(())
}

fn run_cipher_health(path: &std::path::Path, config: &config::Config) -> Result<()> {
    let format = FormatKind::from_path(path).build();
    let store = SecretStore::new(
        Box::new(FileBackend::new(path, format)),
        Argon2AesFactory::new(config.kdf),
        Password::new("health-canary"),
    );
    let canary_key = "health/canary";
    let payload = b"ok";
    store.store(canary_key, payload)?;
    let round_trip = store.fetch_required(canary_key)?;
    store.remove(canary_key)?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}
