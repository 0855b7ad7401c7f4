//! Append-only transition log with file-based persistence.
//!
//! Each run gets its own directory under the registry root:
//!
//! ```text
//! <runs>/<run_id>/events.jsonl
//! <runs>/<run_id>/artifacts/
//! ```
//!
//! Events are newline-delimited JSON so a log can be inspected with standard
//! tools while a run is in flight.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, Run};

/// Registry of all runs under one directory
#[derive(Debug, Clone)]
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create or open the log for a run
    pub async fn open(&self, run_id: Uuid) -> Result<RunLog> {
        let run_dir = self.base_dir.join(run_id.to_string());
        let artifacts_dir = run_dir.join("artifacts");

        fs::create_dir_all(&artifacts_dir).await.with_context(|| {
            format!(
                "Failed to create artifacts directory: {}",
                artifacts_dir.display()
            )
        })?;

        Ok(RunLog {
            events_path: run_dir.join("events.jsonl"),
            artifacts_dir,
        })
    }

    /// Whether a run has ever been recorded
    pub fn contains(&self, run_id: Uuid) -> bool {
        self.base_dir
            .join(run_id.to_string())
            .join("events.jsonl")
            .exists()
    }

    /// Rebuild a run's state from its log
    pub async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        if !self.contains(run_id) {
            return Ok(None);
        }
        let events = self.open(run_id).await?.replay().await?;
        Ok(Run::from_events(&events))
    }

    /// List all run IDs in the registry
    pub async fn list_runs(&self) -> Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// Names of the files a run left in its artifacts directory
    pub async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<String>> {
        let artifacts_dir = self.base_dir.join(run_id.to_string()).join("artifacts");
        let mut artifacts = Vec::new();

        if !artifacts_dir.exists() {
            return Ok(artifacts);
        }

        let mut entries = fs::read_dir(&artifacts_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                artifacts.push(name.to_string());
            }
        }
        artifacts.sort();

        Ok(artifacts)
    }

    /// Remove a run's directory entirely
    pub async fn remove(&self, run_id: Uuid) -> Result<()> {
        let run_dir = self.base_dir.join(run_id.to_string());
        if run_dir.exists() {
            fs::remove_dir_all(&run_dir)
                .await
                .with_context(|| format!("Failed to remove run: {}", run_dir.display()))?;
        }
        Ok(())
    }
}

/// The transition log and artifact directory of one run
#[derive(Debug, Clone)]
pub struct RunLog {
    events_path: PathBuf,
    artifacts_dir: PathBuf,
}

impl RunLog {
    /// Get the artifacts directory
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!("Failed to open events file: {}", self.events_path.display())
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path).await.with_context(|| {
            format!("Failed to open events file: {}", self.events_path.display())
        })?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }
}

/// Hex SHA-256 of some content
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
