//! estate-etl - Event-sourced ETL orchestrator for real-estate sales
//!
//! Reads a CSV of property sale records, normalizes it, and commits it to the
//! directory behind an external warehouse table.
//!
//! # Architecture
//!
//! The pipeline is a task graph (extract -> transform -> load) driven by an
//! orchestrator:
//! - Every node moves through an explicit state machine with retries
//! - Every transition is appended to the run's log; run state is derived by
//!   replaying it
//! - Loads are staged, verified, and swapped into place under a destination
//!   lock, so readers never see a partial table
//!
//! # Modules
//!
//! - `core`: Orchestration logic (RunStore, TaskGraph, RunLimits, locks)
//! - `domain`: Data structures (Event, Run, NodeState, records)
//! - `etl`: Extract, transform and load stages
//! - `storage`: Warehouse storage clients (local, WebHDFS, in-memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline once
//! estate-etl run --source real_estate.csv
//!
//! # Check run status and its transition log
//! estate-etl status <run-id>
//! estate-etl log <run-id>
//!
//! # Re-execute a failed run
//! estate-etl resume <run-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod etl;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, RunHandle, RunStore, TaskGraph};
pub use domain::{Event, EventType, NodeState, Run, RunState};
pub use etl::{Loader, WarehouseTarget};
pub use storage::StorageClient;
