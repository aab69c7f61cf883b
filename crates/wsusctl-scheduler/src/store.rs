//! File-based collection store.
//! Each collection is one pretty-printed JSON array: `<data dir>/<name>.json`.
//! Writes go to a temp file first and are renamed into place. Processes
//! sharing a data directory coordinate through lock files in it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use wsusctl_core::config::expand_path;
use wsusctl_core::error::{Result, WsusError};

pub const TASKS_COLLECTION: &str = "scheduled_tasks";
pub const TRACKING_COLLECTION: &str = "staged_approval_tracking";

const STORE_LOCK: &str = ".store.lock";
const RUN_LOCK_DIR: &str = "locks";

/// Advisory lock on a file, shared by every process using the data dir.
pub type FileLock = fd_lock::RwLock<File>;

#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Store rooted at a configured (possibly `~`-prefixed) directory.
    pub fn from_config_dir(dir: &str) -> Self {
        Self::new(&expand_path(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Load a collection. Missing file = empty. A file that is not valid
    /// UTF-8 JSON is moved aside to `<name>.corrupt` and an empty collection
    /// returned. Any other read failure is an error, so the file is never
    /// replaced by a save based on a collection that was not read.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let file = self.path_for(name);
        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                self.set_aside(name, &file, &e.to_string())?;
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(WsusError::Persistence(format!(
                    "Read {}: {e}",
                    file.display()
                )));
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(items) => Ok(items),
            Err(e) => {
                self.set_aside(name, &file, &e.to_string())?;
                Ok(Vec::new())
            }
        }
    }

    fn set_aside(&self, name: &str, file: &Path, reason: &str) -> Result<()> {
        let aside = self.dir.join(format!("{name}.corrupt"));
        tracing::warn!(
            "⚠️ {} is corrupt ({reason}); moving it to {} and starting empty",
            file.display(),
            aside.display()
        );
        std::fs::rename(file, &aside).map_err(|e| {
            WsusError::Persistence(format!(
                "Could not preserve corrupt {}: {e}",
                file.display()
            ))
        })
    }

    /// Replace a collection on disk.
    pub fn save<T: Serialize>(&self, name: &str, items: &[T]) -> Result<()> {
        self.ensure_dir(&self.dir)?;
        let file = self.path_for(name);
        let tmp = self.dir.join(format!("{name}.json.tmp"));
        let json = serde_json::to_string_pretty(items)?;
        std::fs::write(&tmp, json)
            .map_err(|e| WsusError::Persistence(format!("Write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &file)
            .map_err(|e| WsusError::Persistence(format!("Replace {}: {e}", file.display())))?;
        tracing::debug!("💾 Saved {} {} to {}", items.len(), name, file.display());
        Ok(())
    }

    /// Run `f` holding the store-wide write lock. Load-modify-save cycles
    /// from different processes go through here one at a time.
    pub fn locked<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let mut lock = FileLock::new(self.open_lock(&self.dir, STORE_LOCK)?);
        let _held = lock.write().map_err(|e| {
            WsusError::Persistence(format!("Lock {}: {e}", self.dir.display()))
        })?;
        f()
    }

    /// Lock file guarding runs of one task. Hold `try_write()` on it for
    /// the length of the run.
    pub fn run_lock(&self, task_id: &str) -> Result<FileLock> {
        let name: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let dir = self.dir.join(RUN_LOCK_DIR);
        Ok(FileLock::new(self.open_lock(&dir, &format!("{name}.lock"))?))
    }

    fn open_lock(&self, dir: &Path, name: &str) -> Result<File> {
        self.ensure_dir(dir)?;
        let path = dir.join(name);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| WsusError::Persistence(format!("Open {}: {e}", path.display())))
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| WsusError::Persistence(format!("Create {}: {e}", dir.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let items: Vec<String> = store.load("nothing").unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(&dir.path().join("nested"));
        store.save("names", &["a".to_string(), "b".to_string()]).unwrap();
        let items: Vec<String> = store.load("names").unwrap();
        assert_eq!(items, vec!["a", "b"]);
        assert!(!dir.path().join("nested/names.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_preserved_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        std::fs::write(store.path_for(TASKS_COLLECTION), "{ not json").unwrap();

        let items: Vec<serde_json::Value> = store.load(TASKS_COLLECTION).unwrap();
        assert!(items.is_empty());
        let aside = dir.path().join(format!("{TASKS_COLLECTION}.corrupt"));
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "{ not json");
        assert!(!store.path_for(TASKS_COLLECTION).exists());
    }

    #[test]
    fn test_invalid_utf8_is_preserved_before_next_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let original = b"[\xff\xfe]".to_vec();
        std::fs::write(store.path_for(TASKS_COLLECTION), &original).unwrap();

        let items: Vec<serde_json::Value> = store.load(TASKS_COLLECTION).unwrap();
        assert!(items.is_empty());
        store.save::<serde_json::Value>(TASKS_COLLECTION, &[]).unwrap();

        let aside = dir.path().join(format!("{TASKS_COLLECTION}.corrupt"));
        assert_eq!(std::fs::read(aside).unwrap(), original);
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        // A directory where the file should be: exists but cannot be read.
        std::fs::create_dir(store.path_for(TASKS_COLLECTION)).unwrap();

        let result: Result<Vec<serde_json::Value>> = store.load(TASKS_COLLECTION);
        assert!(matches!(result, Err(WsusError::Persistence(_))));
        assert!(store.path_for(TASKS_COLLECTION).is_dir());
        assert!(!dir.path().join(format!("{TASKS_COLLECTION}.corrupt")).exists());
    }

    #[test]
    fn test_run_lock_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let other = JsonStore::new(dir.path());

        let mut first = store.run_lock("task/1").unwrap();
        let held = first.try_write().unwrap();
        let mut second = other.run_lock("task/1").unwrap();
        assert!(second.try_write().is_err());
        assert!(dir.path().join("locks/task_1.lock").exists());

        drop(held);
        assert!(second.try_write().is_ok());
    }

    #[test]
    fn test_locked_runs_closure_and_returns_its_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let count = store
            .locked(|| {
                store.save("names", &["a".to_string()])?;
                Ok(store.load::<String>("names")?.len())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert!(dir.path().join(STORE_LOCK).exists());
    }
}
