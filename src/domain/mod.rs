//! Domain types for the estate-etl orchestrator.
//!
//! This module contains the core data structures:
//! - Records: source rows and normalized warehouse rows
//! - Node: task node states and the allowed transitions
//! - Events: immutable transition log entries
//! - Run: one execution of the task graph
//! - Artifact: in-memory output passed between nodes

pub mod artifact;
pub mod events;
pub mod node;
pub mod record;
pub mod run;

// Re-export commonly used types
pub use artifact::Artifact;
pub use events::{Event, EventType};
pub use node::NodeState;
pub use record::{NormalizedRecord, RawRecord};
pub use run::{Run, RunState, TransitionError};
