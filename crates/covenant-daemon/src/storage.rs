//! The key-value blob store.
//!
//! Keys are slash-separated paths (`contracts/<addr>/assets/<code>`).
//! Values are opaque blobs; the repositories in [`crate::store`] decide the
//! encoding. Two backends are provided: an in-memory map for tests and a
//! filesystem store with atomic writes for production.
//!
//! Writes within one logical update are serialized per contract by the
//! repository layer; the store itself only guarantees that a single write
//! is atomic (readers see the old or the new blob, never a torn one).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use fs2::FileExt;
use thiserror::Error;

/// Errors from blob-store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No blob exists under the key.
    #[error("key not found")]
    NotFound,

    /// A key contains path components the store refuses.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Underlying I/O failure.
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the store's root lock.
    #[error("storage root is locked by another process")]
    Locked,
}

/// A blob store.
pub trait Storage: Send + Sync + 'static {
    /// Reads the blob under `key`.
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes (creates or replaces) the blob under `key`.
    fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Removes the blob under `key`. Removing a missing key is
    /// `NotFound`.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Lists keys with the given prefix, in lexicographic order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let blobs = self.blobs.read().expect("storage lock poisoned");
        blobs.get(key).cloned().ok_or(StorageError::NotFound)
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().expect("storage lock poisoned");
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().expect("storage lock poisoned");
        blobs.remove(key).map(|_| ()).ok_or(StorageError::NotFound)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let blobs = self.blobs.read().expect("storage lock poisoned");
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Filesystem-backed store.
///
/// Each key maps to a file under the root; writes go to a temporary file
/// in the same directory and are renamed into place. The root carries an
/// advisory lock so two daemons cannot share it.
pub struct FilesystemStorage {
    root: PathBuf,
    _lock: File,
}

impl FilesystemStorage {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_path = root.join(".lock");
        let lock = File::create(&lock_path)?;
        lock.try_lock_exclusive().map_err(|_| StorageError::Locked)?;

        Ok(FilesystemStorage { root, _lock: lock })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| {
                part.is_empty() || part == "." || part == ".." || part.starts_with('.')
            })
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

impl Storage for FilesystemStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename keeps readers from observing a torn blob.
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') || name.ends_with(".tmp") {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
