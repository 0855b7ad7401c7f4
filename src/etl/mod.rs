//! The extract, transform and load stages and their wiring into a graph.

pub mod extract;
pub mod load;
pub mod tasks;
pub mod transform;

use std::sync::Arc;

use anyhow::Result;

use crate::config::ResolvedConfig;
use crate::core::{LockRegistry, Orchestrator, RunStore};
use crate::domain::node::{EXTRACT, LOAD, TRANSFORM};

pub use extract::{ExtractError, Extractor, RecordReader};
pub use load::{LoadError, LoadManifest, LoadOutcome, LoadReport, Loader, RecoveryAction, WarehouseTarget};
pub use tasks::{ExtractTask, LoadTask, TransformTask};
pub use transform::{normalize, transform_all, RejectReason, RejectionSummary, SaleIdCounter, TransformOutput};

/// Loader for the configured warehouse, locking across processes
pub fn configured_loader(config: &ResolvedConfig) -> Result<Loader> {
    Ok(Loader::new(
        config.storage_client()?,
        config.warehouse.clone(),
        LockRegistry::with_lock_dir(config.locks_dir()),
    ))
}

/// Orchestrator for the standard graph, wired from configuration
pub fn configured_orchestrator(config: &ResolvedConfig) -> Result<Orchestrator> {
    let loader = Arc::new(configured_loader(config)?);

    let transform = TransformTask::new(config.transform.sale_id_base, config.limits.clone())
        .keep_cleaned_copy(config.transform.keep_cleaned_copy);

    let orchestrator = Orchestrator::new(
        RunStore::new(config.runs_dir()),
        config.task_graph(),
        config.limits.clone(),
    )
    .register(EXTRACT, Arc::new(ExtractTask::new(config.delimiter)))
    .register(TRANSFORM, Arc::new(transform))
    .register(LOAD, Arc::new(LoadTask::new(loader)));

    orchestrator.validate()?;
    Ok(orchestrator)
}
