//! Transition events for the append-only run log.
//!
//! Every state change of a run or of one of its nodes is recorded as an
//! immutable event. The log is the only externally visible trace of a run's
//! progress, and run state can be rebuilt from it at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeState;

/// A single entry in a run's transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Node name, for node transitions
    pub node: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Node state before the transition
    pub from: Option<NodeState>,

    /// Node state after the transition
    pub to: Option<NodeState>,

    /// Human-readable summary
    pub payload_summary: String,

    /// Source location, recorded when a run starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Rejected record count, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<u64>,

    /// Time taken in milliseconds (for finished attempts)
    pub duration_ms: Option<u64>,

    /// Error detail if something failed
    pub error: Option<String>,
}

impl Event {
    /// Create a run-level event with the current timestamp
    pub fn run(run_id: Uuid, event_type: EventType, payload_summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            node: None,
            event_type,
            from: None,
            to: None,
            payload_summary,
            source: None,
            rejected: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Create a node transition event with the current timestamp
    pub fn transition(
        run_id: Uuid,
        node: &str,
        from: NodeState,
        to: NodeState,
        payload_summary: String,
    ) -> Self {
        Self {
            node: Some(node.to_string()),
            from: Some(from),
            to: Some(to),
            ..Self::run(run_id, EventType::NodeTransition, payload_summary)
        }
    }

    pub fn with_source(mut self, source: String) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_rejected(mut self, rejected: u64) -> Self {
        self.rejected = Some(rejected);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run was triggered (or resumed)
    RunStarted,

    /// Every node reached Success
    RunCompleted,

    /// A node exhausted its retries, failed fatally, or the run was cancelled
    RunFailed,

    /// A node moved from one state to another
    NodeTransition,
}
