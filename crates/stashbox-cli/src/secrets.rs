use std::io::{self, Read, Write};

use color_eyre::{eyre::bail, Result};
use stashbox_core::Password;
use stashbox_storage::PasswordStore;
use tracing::info;

/// Store `value`, or stdin when absent. A single trailing newline from piped
/// input is dropped.
pub fn put(store: &PasswordStore, key: &str, value: Option<String>, force: bool) -> Result<()> {
    let value = match value {
        Some(value) => value.into_bytes(),
        None => read_stdin()?,
    };
    if force {
        store.store_overwrite(key, &value)?;
    } else {
        store.store(key, &value)?;
    }
    info!(key, "secret stored");
    Ok(())
}

/// Write the secret to `out`. A newline is appended only when `out` is a
/// terminal, so piped output is byte-exact.
pub fn get(store: &PasswordStore, key: &str, out: &mut impl Write, terminal: bool) -> Result<()> {
    let value = store.fetch_required(key)?;
    out.write_all(&value)?;
    if terminal && !value.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    Ok(())
}

pub fn list(store: &PasswordStore, out: &mut impl Write) -> Result<()> {
    for key in store.keys()? {
        writeln!(out, "{key}")?;
    }
    Ok(())
}

pub fn remove(store: &PasswordStore, key: &str) -> Result<()> {
    if !store.remove(key)? {
        bail!("no secret stored for key: {key}");
    }
    Ok(())
}

/// Rotate to `new_password`, returning how many secrets were re-encrypted.
pub fn rotate(store: &PasswordStore, new_password: Password) -> Result<usize> {
    if new_password.expose().is_empty() {
        bail!("new password must not be empty");
    }
    Ok(store.change_password(new_password)?)
}

/// New password from `env_var`, or an interactive prompt with confirmation.
pub fn new_password(env_var: Option<&str>) -> Result<Password> {
    if let Some(var) = env_var {
        let value = std::env::var(var)
            .map_err(|e| color_eyre::eyre::eyre!("{var}: {e}"))?;
        return Ok(Password::new(value));
    }
    let first = Password::new(rpassword::prompt_password("New password: ")?);
    let second = Password::new(rpassword::prompt_password("Confirm new password: ")?);
    if first != second {
        bail!("passwords do not match");
    }
    Ok(first)
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    io::stdin().read_to_end(&mut buf)?;
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use stashbox_core::StoreError;
    use stashbox_storage::{cipher::KdfParams, open, StoreOptions};

    use super::*;

    fn temp_store(dir: &std::path::Path) -> PasswordStore {
        open(StoreOptions::new(dir.join("secrets.json"), "pw").kdf(KdfParams::insecure_fast()))
            .expect("open")
    }

    #[test]
    fn put_then_get_writes_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        put(&store, "db", Some("hunter2".into()), false).expect("put");

        let mut out = Vec::new();
        get(&store, "db", &mut out, false).expect("get");
        assert_eq!(out, b"hunter2");
    }

    #[test]
    fn get_appends_newline_only_for_terminals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        put(&store, "db", Some("hunter2".into()), false).expect("put");
        put(&store, "motd", Some("hi\n".into()), false).expect("put");

        let mut out = Vec::new();
        get(&store, "db", &mut out, true).expect("get");
        assert_eq!(out, b"hunter2\n");

        let mut out = Vec::new();
        get(&store, "motd", &mut out, true).expect("get");
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn put_without_force_rejects_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        put(&store, "db", Some("one".into()), false).expect("put");

        let err = put(&store, "db", Some("two".into()), false).expect_err("duplicate");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DuplicateKey { .. })
        ));
        put(&store, "db", Some("two".into()), true).expect("forced put");
        assert_eq!(store.fetch_required("db").expect("fetch"), b"two");
    }

    #[test]
    fn get_missing_key_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        let mut out = Vec::new();
        let err = get(&store, "nope", &mut out, false).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::KeyNotFound { .. })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn list_prints_sorted_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        put(&store, "b", Some("2".into()), false).expect("put");
        put(&store, "a", Some("1".into()), false).expect("put");

        let mut out = Vec::new();
        list(&store, &mut out).expect("list");
        assert_eq!(String::from_utf8(out).expect("utf8"), "a\nb\n");
    }

    #[test]
    fn remove_missing_key_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        put(&store, "a", Some("1".into()), false).expect("put");

        remove(&store, "a").expect("remove");
        assert!(remove(&store, "a").is_err());
    }

    #[test]
    fn rotate_rejects_empty_password() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = temp_store(dir.path());
        assert!(rotate(&store, Password::new("")).is_err());
        put(&store, "a", Some("1".into()), false).expect("put");
        assert_eq!(rotate(&store, Password::new("next")).expect("rotate"), 1);
    }
}
