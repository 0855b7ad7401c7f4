//! Distributed filesystem client abstraction.
//!
//! The loader only talks to storage through [`StorageClient`]. Paths are
//! absolute, `/`-separated strings in the backend's namespace (for example
//! `/user/hive/warehouse/real_estate`), independent of the host filesystem.

pub mod local;
pub mod memory;
pub mod webhdfs;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use local::LocalFsStorage;
pub use memory::MemoryStorage;
pub use webhdfs::WebHdfsStorage;

/// Errors reported by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unreachable: {0}")]
    Unreachable(String),

    #[error("Write to {path} failed: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Rename {from} -> {to} rejected: {reason}")]
    RenameRejected {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the same call later can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unreachable(_) | StorageError::WriteFailed { .. } | StorageError::Io(_)
        )
    }
}

/// Client for the storage the warehouse reads from
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Write `data` to `path`, replacing any existing file and creating
    /// parent directories. Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64, StorageError>;

    /// Read a whole file
    async fn read(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Whether a file or directory exists at `path`
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Atomically move `from` to `to`.
    ///
    /// An existing file at `to` is replaced. An existing directory at `to`
    /// is never merged into; backends reject that with `RenameRejected`.
    async fn atomic_replace(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Recursively delete `path`. Returns `false` if nothing was there.
    async fn delete(&self, path: &str) -> Result<bool, StorageError>;

    /// Create a directory and its parents
    async fn create_dir(&self, path: &str) -> Result<(), StorageError>;
}

/// Join a storage path and a child name with exactly one separator
pub fn join(base: &str, child: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}

/// Normalize a storage path: absolute, no empty or `.`/`..` segments
pub fn normalize(path: &str) -> Result<String, StorageError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(StorageError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    Ok(format!("/{}", segments.join("/")))
}
