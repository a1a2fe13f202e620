use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use fs4::fs_std::FileExt;
use stashbox_core::{ensure_unchanged, Backend, Ciphertext, Format, Mapping, Result, StoreError};
use tracing::{debug, instrument, warn};

/// Modification state of the backing file as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stamp {
    Missing,
    Modified(SystemTime),
}

#[derive(Debug, Default)]
struct CacheState {
    mapping: Option<Mapping>,
    marker: Option<Stamp>,
}

impl CacheState {
    fn invalidate(&mut self) {
        self.mapping = None;
        self.marker = None;
    }
}

/// How a read treats the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
    /// Reload when the file's modification time moved since the last look.
    Checked,
    /// Load once, then serve the cached copy forever.
    Snapshot,
}

enum Change<R> {
    Written(R),
    Unchanged(R),
}

/// Mutable store file: one serialized mapping, cached in memory and reloaded
/// when another process changes the file.
///
/// External edits are detected by modification time, so two writes inside the
/// filesystem's timestamp resolution can look like one. Every write takes an
/// advisory exclusive lock, reloads if the file moved underneath us, applies
/// the change, and rewrites the whole file.
pub struct FileBackend {
    path: PathBuf,
    format: Box<dyn Format>,
    state: Mutex<CacheState>,
}

impl FileBackend {
    /// No I/O happens until the first operation; a missing file is an empty store.
    pub fn new(path: impl Into<PathBuf>, format: Box<dyn Format>) -> Self {
        Self {
            path: path.into(),
            format,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn read_with<R>(
        &self,
        freshness: Freshness,
        read: impl FnOnce(&Mapping) -> R,
    ) -> Result<R> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        if let (Freshness::Snapshot, Some(mapping)) = (freshness, &state.mapping) {
            return Ok(read(mapping));
        }

        let current = self.stamp()?;
        let cached = state.mapping.is_some();
        match state.marker {
            Some(marker) if cached && marker == current => {}
            None if cached => state.marker = Some(current),
            _ => {
                if cached {
                    debug!(path = %self.path.display(), "store file changed on disk, reloading");
                }
                state.mapping = Some(self.read_file()?);
                state.marker = Some(current);
            }
        }
        Ok(read(state.mapping.get_or_insert_with(Mapping::new)))
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut Mapping) -> Result<Change<R>>) -> Result<R> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let file = self.open_for_write()?;
        let _lock = ExclusiveLock::acquire(&file, &self.path)?;

        let current = stamp_of(&file, &self.path)?;
        if state.mapping.is_none() || state.marker != Some(current) {
            state.mapping = Some(self.read_locked(&file)?);
            state.marker = Some(current);
        }

        let mapping = state.mapping.get_or_insert_with(Mapping::new);
        let outcome = match apply(mapping)? {
            Change::Unchanged(outcome) => return Ok(outcome),
            Change::Written(outcome) => outcome,
        };

        match self.write_locked(&file, mapping) {
            Ok(stamp) => {
                debug!(path = %self.path.display(), entries = mapping.len(), "store file saved");
                state.marker = Some(stamp);
                Ok(outcome)
            }
            Err(err) => {
                // The file may be truncated or half written; force a re-read.
                state.invalidate();
                Err(err)
            }
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|err| StoreError::poisoned("store file cache", err))
    }

    fn stamp(&self) -> Result<Stamp> {
        match fs::metadata(&self.path) {
            Ok(meta) => meta
                .modified()
                .map(Stamp::Modified)
                .map_err(StoreError::io(&self.path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Stamp::Missing),
            Err(err) => Err(StoreError::io(&self.path)(err)),
        }
    }

    fn read_file(&self) -> Result<Mapping> {
        match fs::read(&self.path) {
            Ok(bytes) => self.format.decode(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Mapping::new()),
            Err(err) => Err(StoreError::io(&self.path)(err)),
        }
    }

    fn read_locked(&self, mut file: &File) -> Result<Mapping> {
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut buf))
            .map_err(StoreError::io(&self.path))?;
        self.format.decode(&buf)
    }

    fn write_locked(&self, mut file: &File, mapping: &Mapping) -> Result<Stamp> {
        let bytes = self.format.encode(mapping)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&bytes))
            .and_then(|_| file.sync_all())
            .map_err(StoreError::io(&self.path))?;
        stamp_of(file, &self.path)
    }

    fn open_for_write(&self) -> Result<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(&self.path).map_err(StoreError::io(&self.path))
    }
}

fn stamp_of(file: &File, path: &Path) -> Result<Stamp> {
    file.metadata()
        .and_then(|meta| meta.modified())
        .map(Stamp::Modified)
        .map_err(StoreError::io(path))
}

/// Exclusive advisory lock, released when dropped.
struct ExclusiveLock<'a> {
    file: &'a File,
}

impl<'a> ExclusiveLock<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self> {
        FileExt::lock_exclusive(file).map_err(StoreError::io(path))?;
        Ok(Self { file })
    }
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(self.file) {
            warn!("failed to release store file lock: {err}");
        }
    }
}

impl Backend for FileBackend {
    #[instrument(skip_all, fields(key = %key))]
    fn get(&self, key: &str) -> Result<Option<Ciphertext>> {
        self.read_with(Freshness::Checked, |mapping| mapping.get(key).cloned())
    }

    fn keys(&self) -> Result<BTreeSet<String>> {
        self.read_with(Freshness::Checked, |mapping| mapping.keys().cloned().collect())
    }

    #[instrument(skip_all, fields(key = %key))]
    fn insert(&self, key: &str, value: Ciphertext) -> Result<Ciphertext> {
        let duplicate = || StoreError::DuplicateKey {
            key: key.to_string(),
        };
        if self.get(key)?.is_some() {
            return Err(duplicate());
        }
        self.mutate(|mapping| {
            if mapping.contains_key(key) {
                return Err(duplicate());
            }
            mapping.insert(key.to_string(), value.clone());
            Ok(Change::Written(value))
        })
    }

    #[instrument(skip_all, fields(key = %key))]
    fn overwrite(&self, key: &str, value: Ciphertext) -> Result<Ciphertext> {
        self.mutate(|mapping| {
            mapping.insert(key.to_string(), value.clone());
            Ok(Change::Written(value))
        })
    }

    /// Compared against the file as re-read under the exclusive lock, so a
    /// writer that slipped in since `expected` was read is never overwritten.
    #[instrument(skip_all, fields(entries = entries.len()))]
    fn replace_all(&self, expected: &Mapping, entries: Mapping) -> Result<()> {
        if expected.is_empty() && entries.is_empty() {
            return self.read_with(Freshness::Checked, |mapping| ensure_unchanged(expected, mapping))?;
        }
        self.mutate(|mapping| {
            ensure_unchanged(expected, mapping)?;
            if *mapping == entries {
                return Ok(Change::Unchanged(()));
            }
            *mapping = entries;
            Ok(Change::Written(()))
        })
    }

    #[instrument(skip_all, fields(key = %key))]
    fn delete(&self, key: &str) -> Result<Option<Ciphertext>> {
        if self.get(key)?.is_none() {
            return Ok(None);
        }
        self.mutate(|mapping| match mapping.remove(key) {
            Some(prior) => Ok(Change::Written(Some(prior))),
            None => Ok(Change::Unchanged(None)),
        })
    }

    fn reload(&self) -> Result<bool> {
        self.lock_state()?.invalidate();
        self.read_with(Freshness::Checked, |_| ())?;
        Ok(true)
    }

    fn permits_writes(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use filetime::{set_file_mtime, FileTime};

    use super::*;
    use crate::format::{JsonFormat, YamlFormat};

    fn backend_at(path: &Path) -> FileBackend {
        FileBackend::new(path, Box::new(JsonFormat))
    }

    fn sealed(text: &str) -> Ciphertext {
        Ciphertext::new(text)
    }

    /// Push the file's mtime forward so the change is visible regardless of
    /// timestamp resolution.
    fn bump_mtime(path: &Path, secs: u64) {
        let later = SystemTime::now() + Duration::from_secs(secs);
        set_file_mtime(path, FileTime::from_system_time(later)).expect("set mtime");
    }

    #[test]
    fn missing_file_reads_as_empty_and_is_not_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let backend = backend_at(&path);

        assert_eq!(backend.get("anything").expect("get"), None);
        assert!(backend.keys().expect("keys").is_empty());
        assert!(backend.reload().expect("reload"));
        assert_eq!(backend.delete("anything").expect("delete"), None);
        assert!(!path.exists(), "reads must not create the store file");
    }

    #[test]
    fn insert_persists_whole_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/secrets.json");
        let backend = backend_at(&path);

        let stored = backend.insert("a", sealed("one")).expect("insert a");
        assert_eq!(stored, sealed("one"));
        backend.insert("b", sealed("two")).expect("insert b");

        let on_disk = JsonFormat
            .decode(&fs::read(&path).expect("read"))
            .expect("decode");
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk["b"], sealed("two"));
    }

    #[cfg(unix)]
    #[test]
    fn created_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        backend_at(&path).insert("k", sealed("v")).expect("insert");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn duplicate_insert_fails_and_leaves_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let backend = backend_at(&path);
        backend.insert("k", sealed("first")).expect("insert");
        let before = fs::read(&path).expect("read");

        let err = backend.insert("k", sealed("second")).expect_err("duplicate");
        assert_eq!(err, StoreError::DuplicateKey { key: "k".into() });
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn overwrite_replaces_or_creates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend_at(&dir.path().join("secrets.json"));

        backend.overwrite("k", sealed("first")).expect("create");
        backend.overwrite("k", sealed("second")).expect("replace");
        assert_eq!(backend.get("k").expect("get"), Some(sealed("second")));
    }

    #[test]
    fn delete_returns_prior_value_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let backend = backend_at(&path);
        backend.insert("k", sealed("v")).expect("insert");
        backend.insert("keep", sealed("w")).expect("insert");

        assert_eq!(backend.delete("k").expect("delete"), Some(sealed("v")));
        let fresh = backend_at(&path);
        assert_eq!(fresh.get("k").expect("get"), None);
        assert_eq!(fresh.get("keep").expect("get"), Some(sealed("w")));
    }

    #[test]
    fn writes_preserve_entries_from_other_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let first = backend_at(&path);
        let second = backend_at(&path);

        // Prime `first`'s cache before `second` writes.
        assert_eq!(first.get("a").expect("get"), None);
        second.insert("b", sealed("from-second")).expect("insert b");
        bump_mtime(&path, 5);

        first.insert("a", sealed("from-first")).expect("insert a");
        let fresh = backend_at(&path);
        assert_eq!(fresh.get("b").expect("get"), Some(sealed("from-second")));
        assert_eq!(fresh.get("a").expect("get"), Some(sealed("from-first")));
    }

    #[test]
    fn reads_pick_up_external_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let reader = backend_at(&path);
        let writer = backend_at(&path);

        writer.insert("k", sealed("old")).expect("insert");
        assert_eq!(reader.get("k").expect("get"), Some(sealed("old")));

        writer.overwrite("k", sealed("new")).expect("overwrite");
        bump_mtime(&path, 5);
        assert_eq!(reader.get("k").expect("get"), Some(sealed("new")));
    }

    #[test]
    fn unchanged_mtime_serves_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let backend = backend_at(&path);
        backend.insert("k", sealed("cached")).expect("insert");
        let pinned = fs::metadata(&path).expect("meta").modified().expect("mtime");

        // Rewrite behind the backend's back but keep the timestamp.
        fs::write(&path, br#"{"k": "edited"}"#).expect("write");
        set_file_mtime(&path, FileTime::from_system_time(pinned)).expect("restore mtime");
        assert_eq!(backend.get("k").expect("get"), Some(sealed("cached")));

        assert!(backend.reload().expect("reload"));
        assert_eq!(backend.get("k").expect("get"), Some(sealed("edited")));
    }

    #[test]
    fn own_writes_do_not_trigger_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let backend = backend_at(&path);
        backend.insert("k", sealed("v")).expect("insert");

        let state = backend.state.lock().expect("state");
        let on_disk = fs::metadata(&path).expect("meta").modified().expect("mtime");
        assert_eq!(state.marker, Some(Stamp::Modified(on_disk)));
    }

    #[test]
    fn replace_all_is_one_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.yaml");
        let backend = FileBackend::new(&path, Box::new(YamlFormat));
        backend.insert("a", sealed("1")).expect("insert");
        let expected = Mapping::from([("a".to_string(), sealed("1"))]);

        backend
            .replace_all(
                &expected,
                Mapping::from([
                    ("a".to_string(), sealed("x")),
                    ("b".to_string(), sealed("y")),
                ]),
            )
            .expect("replace_all");

        let on_disk = YamlFormat
            .decode(&fs::read(&path).expect("read"))
            .expect("decode");
        assert_eq!(on_disk["a"], sealed("x"));
        assert_eq!(on_disk["b"], sealed("y"));
    }

    #[test]
    fn replace_all_refuses_after_another_instance_deletes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let rotating = backend_at(&path);
        let other = backend_at(&path);
        rotating.insert("keep", sealed("k1")).expect("insert keep");
        rotating.insert("gone", sealed("g1")).expect("insert gone");
        let expected = Mapping::from([
            ("gone".to_string(), sealed("g1")),
            ("keep".to_string(), sealed("k1")),
        ]);
        assert_eq!(rotating.keys().expect("keys").len(), 2);

        other.delete("gone").expect("delete");
        bump_mtime(&path, 5);
        let before = fs::read(&path).expect("read");

        let err = rotating
            .replace_all(
                &expected,
                Mapping::from([
                    ("gone".to_string(), sealed("g2")),
                    ("keep".to_string(), sealed("k2")),
                ]),
            )
            .expect_err("stale batch");
        assert!(matches!(err, StoreError::Conflict { reason } if reason.contains("`gone` was removed")));
        assert_eq!(fs::read(&path).expect("read"), before);
        assert_eq!(rotating.get("gone").expect("get"), None);
    }

    #[test]
    fn replace_all_refuses_entry_added_by_another_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        let rotating = backend_at(&path);
        let other = backend_at(&path);
        rotating.insert("keep", sealed("k1")).expect("insert");
        let expected = Mapping::from([("keep".to_string(), sealed("k1"))]);

        other.insert("late", sealed("l1")).expect("late insert");
        bump_mtime(&path, 5);

        let err = rotating
            .replace_all(&expected, Mapping::from([("keep".to_string(), sealed("k2"))]))
            .expect_err("stale batch");
        assert!(matches!(err, StoreError::Conflict { reason } if reason.contains("`late` was added")));
        assert_eq!(backend_at(&path).get("keep").expect("get"), Some(sealed("k1")));
    }

    #[test]
    fn empty_replace_all_does_not_create_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        backend_at(&path)
            .replace_all(&Mapping::new(), Mapping::new())
            .expect("empty swap");
        assert!(!path.exists());
    }

    /// Decodes JSON but refuses to encode, so saves fail after the lock and
    /// reload have already happened.
    struct UnwritableFormat;

    impl Format for UnwritableFormat {
        fn name(&self) -> &'static str {
            "unwritable"
        }

        fn encode(&self, _mapping: &Mapping) -> Result<Vec<u8>> {
            Err(StoreError::format("encoder refused"))
        }

        fn decode(&self, bytes: &[u8]) -> Result<Mapping> {
            JsonFormat.decode(bytes)
        }
    }

    #[test]
    fn failed_save_clears_cache_and_next_read_goes_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        backend_at(&path).insert("k", sealed("on-disk")).expect("seed");

        let backend = FileBackend::new(&path, Box::new(UnwritableFormat));
        assert_eq!(backend.get("k").expect("get"), Some(sealed("on-disk")));

        let err = backend
            .overwrite("k", sealed("lost"))
            .expect_err("encode fails");
        assert_eq!(err, StoreError::format("encoder refused"));
        {
            let state = backend.state.lock().expect("state");
            assert!(state.mapping.is_none());
            assert!(state.marker.is_none());
        }

        // The failed change must not be served from memory.
        assert_eq!(backend.get("k").expect("get"), Some(sealed("on-disk")));
        let state = backend.state.lock().expect("state");
        assert!(state.mapping.is_some());
        assert!(state.marker.is_some());
    }

    #[test]
    fn corrupt_file_is_a_format_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets.json");
        fs::write(&path, b"{ not json").expect("write");

        let err = backend_at(&path).get("k").expect_err("corrupt");
        assert!(matches!(err, StoreError::Format { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn write_failure_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes open fail.
        let path = dir.path().join("secrets.json");
        fs::create_dir(&path).expect("mkdir");

        let err = backend_at(&path)
            .overwrite("k", sealed("v"))
            .expect_err("cannot write over a directory");
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
