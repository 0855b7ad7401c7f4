//! Directory-backed storage on the local filesystem.
//!
//! Storage paths are mapped below a root directory. File writes go through a
//! temporary file in the destination directory and are renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use super::{normalize, StorageClient, StorageError};

/// Local filesystem storage rooted at a directory
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path to a host path below the root
    pub fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let normalized = normalize(path)?;
        Ok(self.root.join(normalized.trim_start_matches('/')))
    }
}

fn not_found_or(err: std::io::Error, path: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl StorageClient for LocalFsStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;

        fs::create_dir_all(&parent).await?;

        let owned_path = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<u64, StorageError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| StorageError::WriteFailed {
                path: owned_path,
                reason: e.to_string(),
            })?;
            Ok(data.len() as u64)
        })
        .await
        .map_err(|e| StorageError::WriteFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let target = self.resolve(path)?;
        let data = fs::read(&target).await.map_err(|e| not_found_or(e, path))?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        Ok(fs::try_exists(&target).await?)
    }

    async fn atomic_replace(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;

        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(from.to_string()));
        }

        if let Ok(meta) = fs::metadata(&dest).await {
            if meta.is_dir() {
                return Err(StorageError::RenameRejected {
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: "destination directory exists".to_string(),
                });
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&source, &dest)
            .await
            .map_err(|e| StorageError::RenameRejected {
                from: from.to_string(),
                to: to.to_string(),
                reason: e.to_string(),
            })
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        let meta = match fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        Ok(true)
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        fs::create_dir_all(&target).await?;
        Ok(())
    }
}
