//! In-memory storage backend for testing.
//!
//! Thread-safe via `RwLock`. Directories are implicit: a path is a directory
//! when it was created explicitly or when any file lives below it. Renames
//! happen under a single write lock, so they are atomic to readers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{normalize, StorageClient, StorageError};

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

impl Tree {
    fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.dirs.contains(path)
            || self.files.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = path;
        while let Some(idx) = current.rfind('/') {
            current = &current[..idx];
            if current.is_empty() {
                break;
            }
            self.dirs.insert(current.to_string());
        }
    }

    fn remove_under(&mut self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        let before = self.files.len() + self.dirs.len();
        self.files.retain(|k, _| k != path && !k.starts_with(&prefix));
        self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        before != self.files.len() + self.dirs.len()
    }
}

/// In-memory storage, cheap to clone (clones share state)
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    tree: Arc<RwLock<Tree>>,
}

fn poisoned() -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "lock poisoned",
    ))
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All files below `prefix`, keyed by full path
    pub fn files_under(&self, prefix: &str) -> Result<BTreeMap<String, Bytes>, StorageError> {
        let prefix = normalize(prefix)?;
        let dir_prefix = format!("{}/", prefix);
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree
            .files
            .iter()
            .filter(|(k, _)| **k == prefix || k.starts_with(&dir_prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        let path = normalize(path)?;
        let mut tree = self.tree.write().map_err(|_| poisoned())?;

        if tree.is_dir(&path) {
            return Err(StorageError::WriteFailed {
                path,
                reason: "path is a directory".to_string(),
            });
        }

        let len = data.len() as u64;
        tree.add_parents(&path);
        tree.files.insert(path, data);
        Ok(len)
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = normalize(path)?;
        let tree = self.tree.read().map_err(|_| poisoned())?;
        tree.files
            .get(&path)
            .cloned()
            .ok_or(StorageError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let path = normalize(path)?;
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree.is_file(&path) || tree.is_dir(&path))
    }

    async fn atomic_replace(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = normalize(from)?;
        let to = normalize(to)?;
        let mut tree = self.tree.write().map_err(|_| poisoned())?;

        if tree.is_dir(&to) {
            return Err(StorageError::RenameRejected {
                from,
                to,
                reason: "destination directory exists".to_string(),
            });
        }

        if let Some(data) = tree.files.remove(&from) {
            tree.add_parents(&to);
            tree.files.insert(to, data);
            return Ok(());
        }

        if !tree.is_dir(&from) {
            return Err(StorageError::NotFound(from));
        }

        let prefix = format!("{}/", from);
        let moved_files: Vec<(String, Bytes)> = tree
            .files
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (format!("{}/{}", to, &k[prefix.len()..]), v.clone()))
            .collect();
        let moved_dirs: Vec<String> = tree
            .dirs
            .iter()
            .filter(|d| d.starts_with(&prefix))
            .map(|d| format!("{}/{}", to, &d[prefix.len()..]))
            .collect();

        tree.remove_under(&from);
        tree.add_parents(&to);
        tree.dirs.insert(to);
        tree.dirs.extend(moved_dirs);
        tree.files.extend(moved_files);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let path = normalize(path)?;
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        Ok(tree.remove_under(&path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        tree.add_parents(&path);
        tree.dirs.insert(path);
        Ok(())
    }
}
