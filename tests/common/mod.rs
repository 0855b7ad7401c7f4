//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use estate_etl::core::{
    LockRegistry, NodeSpec, Orchestrator, RetryPolicy, RunLimits, RunStore, TaskGraph,
};
use estate_etl::domain::node::{EXTRACT, LOAD, TRANSFORM};
use estate_etl::etl::{ExtractTask, LoadTask, Loader, TransformTask, WarehouseTarget};
use estate_etl::storage::{MemoryStorage, StorageClient, StorageError};

pub const HEADER: &str =
    "List Year,Town,Address,Assessed Value,Sale Amount,Sales Ratio,Property Type,Residential Type";

pub const HARTFORD_ROW: &str = "2006,Hartford,123 Main St,150000,200000,0.75,Residential,Single Family";

/// Write a source CSV with the standard header
pub fn write_source(dir: &Path, rows: &[&str]) -> PathBuf {
    let path = dir.join("real_estate.csv");
    let mut contents = format!("{}\n", HEADER);
    for row in rows {
        contents.push_str(row);
        contents.push('\n');
    }
    std::fs::write(&path, contents).unwrap();
    path
}

/// In-memory storage that fails on request
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    write_failures: AtomicU32,
    rename_fail_to: Mutex<Option<String>>,
    rename_fail_from: Mutex<Option<String>>,
    corrupt_reads: AtomicBool,
    pub writes: AtomicU32,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes report the namenode as unreachable
    pub fn fail_next_writes(&self, n: u32) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    /// Every rename onto `path` is rejected until cleared
    pub fn fail_renames_to(&self, path: Option<&str>) {
        *self.rename_fail_to.lock().unwrap() = path.map(|p| p.to_string());
    }

    /// Every rename out of anything under `prefix` is rejected until cleared
    pub fn fail_renames_from(&self, prefix: Option<&str>) {
        *self.rename_fail_from.lock().unwrap() = prefix.map(|p| p.to_string());
    }

    /// Reads return data that differs from what was written
    pub fn corrupt_reads(&self, on: bool) {
        self.corrupt_reads.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageClient for FaultyStorage {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.write_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.write_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unreachable("connection refused".to_string()));
        }
        self.inner.write(path, data).await
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let data = self.inner.read(path).await?;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            let mut bytes = data.to_vec();
            bytes.truncate(bytes.len().saturating_sub(1));
            return Ok(Bytes::from(bytes));
        }
        Ok(data)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path).await
    }

    async fn atomic_replace(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from_rejected = match self.rename_fail_from.lock().unwrap().as_deref() {
            Some(prefix) => from.starts_with(prefix),
            None => false,
        };
        if from_rejected || self.rename_fail_to.lock().unwrap().as_deref() == Some(to) {
            return Err(StorageError::RenameRejected {
                from: from.to_string(),
                to: to.to_string(),
                reason: "injected".to_string(),
            });
        }
        self.inner.atomic_replace(from, to).await
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.delete(path).await
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        self.inner.create_dir(path).await
    }
}

/// The standard graph with millisecond backoff so tests stay fast
pub fn fast_graph(retries: [u32; 3]) -> TaskGraph {
    let policy = |n| RetryPolicy::fixed(n, Duration::from_millis(5));
    TaskGraph {
        name: "real_estate_etl".to_string(),
        description: String::new(),
        nodes: vec![
            NodeSpec::new(EXTRACT).with_retry_policy(policy(retries[0])),
            NodeSpec::new(TRANSFORM)
                .after(EXTRACT)
                .with_retry_policy(policy(retries[1])),
            NodeSpec::new(LOAD)
                .after(TRANSFORM)
                .with_retry_policy(policy(retries[2])),
        ],
    }
}

pub fn loader(storage: Arc<dyn StorageClient>, locks: LockRegistry) -> Arc<Loader> {
    Arc::new(Loader::new(storage, WarehouseTarget::default(), locks))
}

/// Orchestrator wired with the real node bodies
pub fn etl_orchestrator(runs_dir: &Path, graph: TaskGraph, loader: Arc<Loader>) -> Arc<Orchestrator> {
    Arc::new(
        Orchestrator::new(RunStore::new(runs_dir), graph, RunLimits::default())
            .register(EXTRACT, Arc::new(ExtractTask::default()))
            .register(TRANSFORM, Arc::new(TransformTask::default()))
            .register(LOAD, Arc::new(LoadTask::new(loader))),
    )
}
