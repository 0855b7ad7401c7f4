//! Run state and reconstruction from events.
//!
//! A Run is one execution attempt of the whole graph. The orchestrator is the
//! only writer of a Run; everyone else sees it through the transition log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::events::{Event, EventType};
use super::node::NodeState;

/// Rejected attempt to move a node along an edge the state machine lacks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Invalid transition for node '{node}': {from} -> {to}")]
    Invalid {
        node: String,
        from: NodeState,
        to: NodeState,
    },
}

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Source location the run reads from
    pub source: String,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// State of each node (node name -> state)
    pub nodes: HashMap<String, NodeState>,

    /// Attempts made per node
    pub attempts: HashMap<String, u32>,

    /// Records rejected by the transform stage, once known
    pub rejected_records: Option<u64>,
}

impl Run {
    /// Create a new run with every node Pending
    pub fn new<I, S>(id: Uuid, source: String, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            source,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            nodes: nodes
                .into_iter()
                .map(|n| (n.into(), NodeState::Pending))
                .collect(),
            attempts: HashMap::new(),
            rejected_records: None,
        }
    }

    /// Move a node to a new state, returning the state it left
    pub fn transition(&mut self, node: &str, to: NodeState) -> Result<NodeState, TransitionError> {
        let current = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| TransitionError::UnknownNode(node.to_string()))?;

        let from = *current;
        if !from.can_transition(to) {
            return Err(TransitionError::Invalid {
                node: node.to_string(),
                from,
                to,
            });
        }

        *current = to;
        if to == NodeState::Running {
            *self.attempts.entry(node.to_string()).or_insert(0) += 1;
        }
        Ok(from)
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            id: first_event.run_id,
            source: String::new(),
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            nodes: HashMap::new(),
            attempts: HashMap::new(),
            rejected_records: None,
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                // A resumed run re-executes every node from scratch
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                self.completed_at = None;
                self.rejected_records = None;
                self.attempts.clear();
                for state in self.nodes.values_mut() {
                    *state = NodeState::Pending;
                }
                if let Some(ref source) = event.source {
                    self.source = source.clone();
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Success;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::NodeTransition => {
                if let (Some(ref node), Some(to)) = (&event.node, event.to) {
                    self.nodes.insert(node.clone(), to);
                    if to == NodeState::Running {
                        *self.attempts.entry(node.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        if event.rejected.is_some() {
            self.rejected_records = event.rejected;
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Current state of a node, if it belongs to this run
    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.nodes.get(node).copied()
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Every node succeeded
    Success,

    /// A node failed terminally, the run timed out, or it was cancelled
    Failed { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn etl_run() -> Run {
        Run::new(
            Uuid::new_v4(),
            "input.csv".to_string(),
            ["extract", "transform", "load"],
        )
    }

    #[test]
    fn test_run_creation() {
        let run = etl_run();
        assert!(run.is_running());
        assert_eq!(run.node_state("extract"), Some(NodeState::Pending));
        assert_eq!(run.node_state("load"), Some(NodeState::Pending));
    }

    #[test]
    fn test_transition_validation() {
        let mut run = etl_run();

        assert_eq!(
            run.transition("extract", NodeState::Running),
            Ok(NodeState::Pending)
        );
        assert_eq!(run.attempts.get("extract"), Some(&1));

        let err = run.transition("extract", NodeState::Retrying).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));

        let err = run.transition("publish", NodeState::Running).unwrap_err();
        assert_eq!(err, TransitionError::UnknownNode("publish".to_string()));
    }

    #[test]
    fn test_run_from_events() {
        let run_id = Uuid::new_v4();

        let events = vec![
            Event::run(run_id, EventType::RunStarted, "started".to_string())
                .with_source("input.csv".to_string()),
            Event::transition(
                run_id,
                "extract",
                NodeState::Pending,
                NodeState::Running,
                "attempt 1".to_string(),
            ),
            Event::transition(
                run_id,
                "extract",
                NodeState::Running,
                NodeState::Success,
                "done".to_string(),
            ),
            Event::transition(
                run_id,
                "transform",
                NodeState::Running,
                NodeState::Success,
                "done".to_string(),
            )
            .with_rejected(3),
            Event::run(run_id, EventType::RunCompleted, "completed".to_string()),
        ];

        let run = Run::from_events(&events).unwrap();

        assert_eq!(run.id, run_id);
        assert_eq!(run.source, "input.csv");
        assert_eq!(run.state, RunState::Success);
        assert_eq!(run.node_state("extract"), Some(NodeState::Success));
        assert_eq!(run.rejected_records, Some(3));
        assert_eq!(run.attempts.get("extract"), Some(&1));
    }

    #[test]
    fn test_restart_resets_nodes() {
        let run_id = Uuid::new_v4();
        let mut run = Run::from_events(&[
            Event::run(run_id, EventType::RunStarted, "started".to_string()),
            Event::transition(
                run_id,
                "load",
                NodeState::Running,
                NodeState::Failed,
                "failed".to_string(),
            ),
            Event::run(run_id, EventType::RunFailed, "failed".to_string())
                .with_error("boom".to_string()),
        ])
        .unwrap();

        assert_eq!(
            run.state,
            RunState::Failed {
                error: "boom".to_string()
            }
        );

        run.apply_event(&Event::run(run_id, EventType::RunStarted, "resumed".to_string()));
        assert!(run.is_running());
        assert_eq!(run.node_state("load"), Some(NodeState::Pending));
    }
}
