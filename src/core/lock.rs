//! Named destination locks.
//!
//! At most one commit may touch a given warehouse location at a time. Within
//! a process that is a tokio mutex per key; across processes sharing the same
//! home directory an exclusive `fs2` lock on a per-key file is held as well.
//! Both are released when the guard is dropped, which covers success, failure
//! and cancellation alike.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock registry poisoned")]
    Poisoned,

    #[error("Failed to lock {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Hands out exclusive guards keyed by destination
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    keys: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    lock_dir: Option<PathBuf>,
}

impl LockRegistry {
    /// In-process locking only
    pub fn new() -> Self {
        Self::default()
    }

    /// Also take a file lock under `dir` for each key
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            keys: Arc::default(),
            lock_dir: Some(dir.into()),
        }
    }

    fn slot(&self, key: &str) -> Result<Arc<AsyncMutex<()>>, LockError> {
        let mut keys = self.keys.lock().map_err(|_| LockError::Poisoned)?;
        Ok(keys.entry(key.to_string()).or_default().clone())
    }

    /// Wait for and take the lock on `key`
    pub async fn acquire(&self, key: &str) -> Result<DestinationGuard, LockError> {
        let local = self.slot(key)?.lock_owned().await;

        let file = match &self.lock_dir {
            Some(dir) => Some(lock_file(dir.join(lock_file_name(key))).await?),
            None => None,
        };

        debug!(key, "Destination lock acquired");
        Ok(DestinationGuard {
            key: key.to_string(),
            _local: local,
            file,
        })
    }

    /// Whether some guard currently holds `key` in this process
    pub fn is_held(&self, key: &str) -> bool {
        match self.slot(key) {
            Ok(slot) => slot.try_lock().is_err(),
            Err(_) => false,
        }
    }
}

/// `<sha256(key)[..16]>.lock`
fn lock_file_name(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}.lock", hex::encode(&digest[..8]))
}

async fn lock_file(path: PathBuf) -> Result<File, LockError> {
    let locked = tokio::task::spawn_blocking(move || {
        let open = || -> std::io::Result<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        };
        open().map_err(|source| LockError::File {
            path: path.clone(),
            source,
        })
    })
    .await;

    match locked {
        Ok(result) => result,
        Err(join) => Err(LockError::File {
            path: PathBuf::new(),
            source: std::io::Error::new(std::io::ErrorKind::Other, join),
        }),
    }
}

/// Held lock on one destination; released on drop
#[derive(Debug)]
pub struct DestinationGuard {
    key: String,
    _local: OwnedMutexGuard<()>,
    file: Option<File>,
}

impl DestinationGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DestinationGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        debug!(key = %self.key, "Destination lock released");
    }
}
