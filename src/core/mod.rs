//! Core orchestration logic.
//!
//! This module contains:
//! - RunStore / RunLog: Append-only transition logs, one per run
//! - TaskGraph: Graph definitions, validation and ordering
//! - RunLimits: Run-level limits and enforcement
//! - LockRegistry: Exclusive locks per destination
//! - TaskBody: The interface node bodies implement
//! - Orchestrator: Main execution engine

pub mod event_store;
pub mod graph;
pub mod limits;
pub mod lock;
pub mod orchestrator;
pub mod task;

// Re-export commonly used types
pub use event_store::{content_digest, RunLog, RunStore};
pub use graph::{NodeOverride, NodeSpec, RetryPolicy, TaskGraph};
pub use limits::{LimitViolation, RunLimits, RunTracker};
pub use lock::{DestinationGuard, LockError, LockRegistry};
pub use orchestrator::{Orchestrator, RunHandle};
pub use task::{ErrorClass, NodeContext, TaskBody, TaskError};
