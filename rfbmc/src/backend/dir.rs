//! Durable revisioned store on a directory of JSON documents.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── <id>.json        <- {"revision": N, "item": {...}}
//! ├── <id>.lock        <- advisory lock target, created on first write
//! └── ...
//! ```
//!
//! Identifiers are escaped into file stems (`[A-Za-z0-9_-]` kept, every other
//! byte written as `%xx`), so any string is a valid id. Writers serialize on
//! an exclusive OS lock of the per-entry lock file and publish with
//! write-to-temp then rename, so readers never observe a torn document and
//! need no lock. The lock file itself is never removed; the OS drops the lock
//! when its holder exits, so a crashed writer cannot wedge an entry.
//!
//! A newly created entry takes its first revision from the wall clock
//! (nanoseconds since the epoch), so an entry that is deleted and recreated
//! does not reuse a revision a stale writer may still expect.
//!
//! Wrap a [`DirStore`] in a [`CasBackend`](super::cas::CasBackend) to get a
//! [`Backend`](super::Backend):
//!
//! ```rust,no_run
//! use rfbmc::backend::cas::CasBackend;
//! use rfbmc::backend::dir::DirStore;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = CasBackend::new(DirStore::open("./results", Duration::from_secs(5))?);
//! # Ok(())
//! # }
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Item;
use super::cas::{Revisioned, RevisionedStore};
use crate::error::BackendError;

/// Extension of entry documents.
const ENTRY_EXTENSION: &str = "json";

/// Extension of entry lock files.
const LOCK_EXTENSION: &str = "lock";

/// Poll interval while waiting for a lock.
const LOCK_POLL: Duration = Duration::from_millis(1);

/// On-disk form of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredItem {
    revision: u64,
    item: Item,
}

/// [`RevisionedStore`] keeping one JSON document per item in a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    path: PathBuf,
    lock_timeout: Duration,
}

/// Holds an exclusive lock on an entry's lock file until dropped.
struct EntryLock {
    file: File,
    path: PathBuf,
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "failed to release entry lock: {e}");
        }
    }
}

fn unavailable(operation: &'static str, path: &Path, source: std::io::Error) -> BackendError {
    BackendError::Unavailable {
        operation,
        reason: format!("I/O on '{}'", path.display()),
        source: Some(source),
    }
}

impl DirStore {
    /// Opens a store directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| unavailable("open", &path, e))?;
        Ok(Self { path, lock_timeout })
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists the ids of all stored items, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] if the directory cannot be read.
    pub fn ids(&self) -> Result<Vec<String>, BackendError> {
        let entries = fs::read_dir(&self.path).map_err(|e| unavailable("list", &self.path, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| unavailable("list", &self.path, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(unescape_id) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{}.{ENTRY_EXTENSION}", escape_id(id)))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{}.{LOCK_EXTENSION}", escape_id(id)))
    }

    fn lock(&self, id: &str) -> Result<EntryLock, BackendError> {
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| unavailable("lock", &path, e))?;
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(EntryLock { file, path }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(BackendError::Unavailable {
                            operation: "lock",
                            reason: format!(
                                "timed out after {:?} waiting for '{}'",
                                self.lock_timeout,
                                path.display()
                            ),
                            source: None,
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(unavailable("lock", &path, e)),
            }
        }
    }
}

impl RevisionedStore for DirStore {
    fn read(&self, id: &str) -> Result<Option<Revisioned>, BackendError> {
        let path = self.entry_path(id);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("read", &path, e)),
        };

        let stored: StoredItem =
            serde_json::from_str(&data).map_err(|e| BackendError::Corrupted {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if stored.item.id != id {
            return Err(BackendError::Corrupted {
                id: id.to_string(),
                reason: format!("document holds item '{}'", stored.item.id),
            });
        }

        Ok(Some(Revisioned {
            revision: stored.revision,
            item: stored.item,
        }))
    }

    fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<u64>,
        item: Option<&Item>,
    ) -> Result<bool, BackendError> {
        let _lock = self.lock(id)?;

        let current = self.read(id)?.map(|r| r.revision);
        if current != expected {
            return Ok(false);
        }

        let path = self.entry_path(id);
        match item {
            Some(item) => {
                let stored = StoredItem {
                    revision: current.map_or_else(first_revision, |r| r.saturating_add(1)),
                    item: item.clone(),
                };
                let json = serde_json::to_string_pretty(&stored).map_err(|e| {
                    BackendError::Corrupted {
                        id: id.to_string(),
                        reason: format!("failed to serialize: {e}"),
                    }
                })?;
                publish(&path, &json)?;
            }
            None => {
                fs::remove_file(&path).map_err(|e| unavailable("delete", &path, e))?;
            }
        }

        Ok(true)
    }
}

/// Writes `contents` next to `path` and renames it into place.
///
/// The temporary file is removed again if the rename fails.
fn publish(path: &Path, contents: &str) -> Result<(), BackendError> {
    let tmp_path = path.with_extension(format!("{ENTRY_EXTENSION}.tmp"));
    fs::write(&tmp_path, contents).map_err(|e| unavailable("write", &tmp_path, e))?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        if let Err(cleanup) = fs::remove_file(&tmp_path) {
            warn!(path = %tmp_path.display(), "failed to remove temporary document: {cleanup}");
        }
        return Err(unavailable("write", path, e));
    }
    Ok(())
}

/// Revision for a newly created entry.
fn first_revision() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .max(1)
}

/// Escapes an id into a file stem.
fn escape_id(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02x}"));
        }
    }
    stem
}

/// Inverse of [`escape_id`]; `None` for stems it could not have produced.
fn unescape_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cas::CasBackend;
    use crate::backend::{AttributeValue, Backend, Condition, UpdateItem, VERSION_ATTRIBUTE};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn v1_item(id: &str) -> Item {
        Item::new(id).with(VERSION_ATTRIBUTE, AttributeValue::Number(1))
    }

    #[test]
    fn test_escape_round_trip() {
        for id in ["plain", "with space", "../etc/passwd", "100%", "ünï", ""] {
            let stem = escape_id(id);
            assert!(!stem.contains('/') && !stem.contains('.'));
            assert_eq!(unescape_id(&stem).as_deref(), Some(id));
        }
        assert_eq!(unescape_id("%zz"), None);
        assert_eq!(unescape_id("%4"), None);
    }

    #[test]
    fn test_compare_and_swap_revisions() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path(), Duration::from_secs(1)).unwrap();

        assert!(store.read("a").unwrap().is_none());
        assert!(store.compare_and_swap("a", None, Some(&v1_item("a"))).unwrap());
        assert!(!store.compare_and_swap("a", None, Some(&v1_item("a"))).unwrap());

        let first = store.read("a").unwrap().unwrap().revision;
        assert!(store.compare_and_swap("a", Some(first), Some(&v1_item("a"))).unwrap());
        let second = store.read("a").unwrap().unwrap().revision;
        assert_eq!(second, first + 1);

        assert!(!store.compare_and_swap("a", Some(first), None).unwrap());
        assert!(store.compare_and_swap("a", Some(second), None).unwrap());
        assert!(store.read("a").unwrap().is_none());

        // A recreated entry does not reuse the old revisions.
        assert!(store.compare_and_swap("a", None, Some(&v1_item("a"))).unwrap());
        let recreated = store.read("a").unwrap().unwrap().revision;
        assert!(recreated != first && recreated != second);
    }

    #[test]
    fn test_ids_lists_entries() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path(), Duration::from_secs(1)).unwrap();
        store.compare_and_swap("b c", None, Some(&v1_item("b c"))).unwrap();
        store.compare_and_swap("a", None, Some(&v1_item("a"))).unwrap();

        assert_eq!(store.ids().unwrap(), vec!["a".to_string(), "b c".to_string()]);
        assert!(!dir.path().join("a.json.tmp").exists());
    }

    #[test]
    fn test_corrupted_document() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path(), Duration::from_secs(1)).unwrap();
        fs::write(dir.path().join("a.json"), "{ invalid json }").unwrap();

        match store.read("a").unwrap_err() {
            BackendError::Corrupted { id, .. } => assert_eq!(id, "a"),
            other => panic!("Expected Corrupted error, got: {:?}", other),
        }
    }

    #[test]
    fn test_lock_timeout() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path(), Duration::from_millis(20)).unwrap();
        let _held = store.lock("a").unwrap();

        match store.compare_and_swap("a", None, Some(&v1_item("a"))).unwrap_err() {
            BackendError::Unavailable { operation, .. } => assert_eq!(operation, "lock"),
            other => panic!("Expected Unavailable error, got: {:?}", other),
        }
    }

    #[test]
    fn test_leftover_lock_file_does_not_block_writers() {
        let dir = tempdir().unwrap();
        // A writer that crashed leaves its lock file behind, but no lock.
        fs::write(dir.path().join("a.lock"), b"").unwrap();
        let store = DirStore::open(dir.path(), Duration::from_millis(200)).unwrap();

        for _ in 0..3 {
            let expected = store.read("a").unwrap().map(|r| r.revision);
            assert!(store.compare_and_swap("a", expected, Some(&v1_item("a"))).unwrap());
        }
        assert!(dir.path().join("a.lock").exists());
    }

    #[test]
    fn test_failed_publish_removes_temporary_file() {
        let dir = tempdir().unwrap();
        // A non-empty directory in the way makes the rename fail.
        let target = dir.path().join("a.json");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("occupant"), b"x").unwrap();

        match publish(&target, "{}").unwrap_err() {
            BackendError::Unavailable { operation, .. } => assert_eq!(operation, "write"),
            other => panic!("Expected Unavailable error, got: {:?}", other),
        }
        assert!(!dir.path().join("a.json.tmp").exists());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path(), Duration::from_millis(20)).unwrap();
        drop(store.lock("a").unwrap());
        let _again = store.lock("a").unwrap();
    }

    #[test]
    fn test_concurrent_backends_share_directory() {
        let dir = tempdir().unwrap();
        let first = CasBackend::new(DirStore::open(dir.path(), Duration::from_secs(5)).unwrap());
        first.put_item(v1_item("a"), Condition::NotExists).unwrap();

        let update = UpdateItem {
            map_attribute: "counts".to_string(),
            increments: BTreeMap::from([("x".to_string(), 1)]),
            condition: Condition::VersionEquals(1),
        };

        std::thread::scope(|s| {
            for _ in 0..4 {
                let path = dir.path().to_path_buf();
                let update = update.clone();
                s.spawn(move || {
                    let backend =
                        CasBackend::new(DirStore::open(path, Duration::from_secs(5)).unwrap());
                    for _ in 0..25 {
                        backend.update_item("a", &update).unwrap();
                    }
                });
            }
        });

        let item = first.get_item("a").unwrap().unwrap();
        let counts = item.get("counts").and_then(AttributeValue::as_map).unwrap();
        assert_eq!(counts["x"], AttributeValue::Number(100));
    }
}
