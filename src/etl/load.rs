//! Warehouse loader.
//!
//! A load never writes into the table location directly. The run's records
//! are staged under `<staging_root>/<run_id>/` next to a manifest, read back
//! and verified, and only then swapped into place under the destination
//! lock:
//!
//! 1. recover from any interrupted previous commit
//! 2. move the current table directory to `<location>.previous`
//! 3. move the staged directory to `<location>`
//! 4. delete `<location>.previous`
//!
//! Readers see either the old directory or the new one. If the process dies
//! between steps 2 and 3 the next load (or [`Loader::recover`]) puts the old
//! directory back.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::event_store::content_digest;
use crate::core::lock::{LockError, LockRegistry};
use crate::domain::NormalizedRecord;
use crate::storage::{join, StorageClient, StorageError};

use super::transform::to_csv;

/// Manifest file written next to the data in every committed directory
pub const MANIFEST_FILE: &str = "_MANIFEST.json";

const BACKUP_SUFFIX: &str = ".previous";

/// Errors that can occur during a load
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Storage write failed: {0}")]
    StorageWriteFailed(#[source] StorageError),

    #[error("Storage unreachable: {0}")]
    StorageUnreachable(String),

    #[error("Verification failed for {path}: {reason}")]
    VerificationFailed { path: String, reason: String },

    #[error("Invalid warehouse target: {0}")]
    InvalidTarget(String),

    #[error("Failed to encode records: {0}")]
    Encode(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl LoadError {
    /// Whether the load may succeed if attempted again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoadError::StorageWriteFailed(_) | LoadError::StorageUnreachable(_) | LoadError::Lock(_)
        )
    }
}

impl From<StorageError> for LoadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unreachable(reason) => LoadError::StorageUnreachable(reason),
            StorageError::InvalidPath(path) => LoadError::InvalidTarget(path),
            other => LoadError::StorageWriteFailed(other),
        }
    }
}

/// Where the warehouse table lives and where loads are staged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseTarget {
    /// Directory the external table reads from
    pub location: String,

    /// Name of the data file inside the table directory
    pub file_name: String,

    /// Parent of per-run staging directories
    pub staging_root: String,
}

impl Default for WarehouseTarget {
    fn default() -> Self {
        Self {
            location: "/user/hive/warehouse/real_estate".to_string(),
            file_name: "real_estate_sales.csv".to_string(),
            staging_root: "/user/etl/staging/real_estate".to_string(),
        }
    }
}

impl WarehouseTarget {
    pub fn staging_dir(&self, run_id: Uuid) -> String {
        join(&self.staging_root, &run_id.to_string())
    }

    pub fn backup_location(&self) -> String {
        format!("{}{}", self.location.trim_end_matches('/'), BACKUP_SUFFIX)
    }

    pub fn data_path(&self) -> String {
        join(&self.location, &self.file_name)
    }

    pub fn manifest_path(&self) -> String {
        join(&self.location, MANIFEST_FILE)
    }
}

/// Describes the data in a committed directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadManifest {
    pub run_id: Uuid,
    pub file_name: String,
    pub row_count: u64,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    /// New data was swapped into place
    Committed,
    /// The table already held exactly this run's data
    AlreadyCommitted,
}

/// What a load did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    pub run_id: Uuid,
    pub outcome: LoadOutcome,
    pub location: String,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// What recovery found at the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No interrupted commit
    Clean,
    /// The table was missing and the backup was moved back
    RestoredBackup,
    /// The new data was in place; the leftover backup was removed
    DiscardedBackup,
}

/// Writes normalized records into the warehouse table location
pub struct Loader {
    storage: Arc<dyn StorageClient>,
    target: WarehouseTarget,
    locks: LockRegistry,
}

impl Loader {
    pub fn new(storage: Arc<dyn StorageClient>, target: WarehouseTarget, locks: LockRegistry) -> Self {
        Self {
            storage,
            target,
            locks,
        }
    }

    pub fn target(&self) -> &WarehouseTarget {
        &self.target
    }

    pub fn storage(&self) -> &Arc<dyn StorageClient> {
        &self.storage
    }

    /// Stage, verify and commit a run's records
    #[instrument(
        skip(self, records),
        fields(storage = self.storage.name(), location = %self.target.location, rows = records.len())
    )]
    pub async fn load(
        &self,
        run_id: Uuid,
        records: &[NormalizedRecord],
    ) -> Result<LoadReport, LoadError> {
        let data = to_csv(records).map_err(|e| LoadError::Encode(e.to_string()))?;
        let data = Bytes::from(data);

        let manifest = LoadManifest {
            run_id,
            file_name: self.target.file_name.clone(),
            row_count: records.len() as u64,
            bytes: data.len() as u64,
            sha256: content_digest(&data),
        };

        let staging = self.stage(&manifest, data).await?;

        let _guard = self.locks.acquire(&self.target.location).await?;
        self.recover_locked().await?;

        let outcome = if self.current_manifest().await?.as_ref() == Some(&manifest) {
            info!(%run_id, "Run already committed, discarding staged copy");
            self.storage.delete(&staging).await?;
            LoadOutcome::AlreadyCommitted
        } else {
            self.swap(&staging).await?;
            info!(%run_id, rows = manifest.row_count, bytes = manifest.bytes, "Load committed");
            LoadOutcome::Committed
        };

        Ok(LoadReport {
            run_id,
            outcome,
            location: self.target.location.clone(),
            rows: manifest.row_count,
            bytes: manifest.bytes,
            sha256: manifest.sha256,
        })
    }

    /// Write data and manifest to a fresh staging directory and verify them
    async fn stage(&self, manifest: &LoadManifest, data: Bytes) -> Result<String, LoadError> {
        let dir = self.target.staging_dir(manifest.run_id);

        // Leftovers from an earlier attempt of the same run
        self.storage.delete(&dir).await?;

        let data_path = join(&dir, &self.target.file_name);
        let written = self.storage.write(&data_path, data).await?;
        if written != manifest.bytes {
            return Err(LoadError::VerificationFailed {
                path: data_path,
                reason: format!("wrote {} of {} bytes", written, manifest.bytes),
            });
        }

        self.verify(&data_path, manifest).await?;

        let encoded =
            serde_json::to_vec_pretty(manifest).map_err(|e| LoadError::Encode(e.to_string()))?;
        self.storage
            .write(&join(&dir, MANIFEST_FILE), Bytes::from(encoded))
            .await?;

        Ok(dir)
    }

    /// Read a staged file back and compare it with what was meant to be written
    async fn verify(&self, path: &str, manifest: &LoadManifest) -> Result<(), LoadError> {
        let readback = self.storage.read(path).await?;
        let fail = |reason: String| LoadError::VerificationFailed {
            path: path.to_string(),
            reason,
        };

        if readback.len() as u64 != manifest.bytes {
            return Err(fail(format!(
                "read back {} bytes, expected {}",
                readback.len(),
                manifest.bytes
            )));
        }
        if content_digest(&readback) != manifest.sha256 {
            return Err(fail("checksum mismatch".to_string()));
        }

        let rows = count_rows(&readback).map_err(|e| fail(e.to_string()))?;
        if rows != manifest.row_count {
            return Err(fail(format!(
                "read back {} rows, expected {}",
                rows, manifest.row_count
            )));
        }

        Ok(())
    }

    /// Move the staged directory into the table location
    async fn swap(&self, staging: &str) -> Result<(), LoadError> {
        let location = &self.target.location;
        let backup = self.target.backup_location();

        if let Some(parent) = parent_of(location) {
            self.storage.create_dir(parent).await?;
        }

        let had_previous = self.storage.exists(location).await?;
        if had_previous {
            self.storage.atomic_replace(location, &backup).await?;
        }

        if let Err(e) = self.storage.atomic_replace(staging, location).await {
            if had_previous {
                if let Err(rollback) = self.storage.atomic_replace(&backup, location).await {
                    warn!(error = %rollback, "Rollback failed, previous data left at backup");
                }
            }
            return Err(e.into());
        }

        if had_previous {
            if let Err(e) = self.storage.delete(&backup).await {
                // Committed; the next load removes the stale backup
                warn!(error = %e, "Failed to remove backup after commit");
            }
        }

        Ok(())
    }

    /// Repair an interrupted commit at the destination
    pub async fn recover(&self) -> Result<RecoveryAction, LoadError> {
        let _guard = self.locks.acquire(&self.target.location).await?;
        self.recover_locked().await
    }

    async fn recover_locked(&self) -> Result<RecoveryAction, LoadError> {
        let backup = self.target.backup_location();
        if !self.storage.exists(&backup).await? {
            return Ok(RecoveryAction::Clean);
        }

        if self.storage.exists(&self.target.location).await? {
            warn!(%backup, "Removing backup left by an interrupted commit");
            self.storage.delete(&backup).await?;
            Ok(RecoveryAction::DiscardedBackup)
        } else {
            warn!(%backup, "Restoring table from backup left by an interrupted commit");
            self.storage
                .atomic_replace(&backup, &self.target.location)
                .await?;
            Ok(RecoveryAction::RestoredBackup)
        }
    }

    /// Manifest of the data currently visible at the table location
    pub async fn current_manifest(&self) -> Result<Option<LoadManifest>, LoadError> {
        let raw = match self.storage.read(&self.target.manifest_path()).await {
            Ok(raw) => raw,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&raw) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!(error = %e, "Unreadable manifest at table location");
                Ok(None)
            }
        }
    }

    /// Remove a run's staging directory
    pub async fn discard_staging(&self, run_id: Uuid) -> Result<bool, LoadError> {
        Ok(self.storage.delete(&self.target.staging_dir(run_id)).await?)
    }
}

fn count_rows(data: &[u8]) -> Result<u64, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(data);
    let mut rows = 0;
    for record in reader.records() {
        record?;
        rows += 1;
    }
    Ok(rows)
}

fn parent_of(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}
