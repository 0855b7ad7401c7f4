//! Task node states and the transitions allowed between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the extract node in the standard graph
pub const EXTRACT: &str = "extract";

/// Name of the transform node in the standard graph
pub const TRANSFORM: &str = "transform";

/// Name of the load node in the standard graph
pub const LOAD: &str = "load";

/// State of a single task node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Not yet started
    Pending,

    /// Body is executing
    Running,

    /// Body returned successfully
    Success,

    /// Body failed; terminal unless followed by `Retrying`
    Failed,

    /// Waiting out the backoff before the next attempt
    Retrying,
}

impl NodeState {
    /// Whether `self -> to` is an edge of the node state machine.
    ///
    /// `Pending -> Failed` covers cancellation before the node ever ran.
    pub fn can_transition(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Failed, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Success => "success",
            NodeState::Failed => "failed",
            NodeState::Retrying => "retrying",
        };
        f.pad(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_cycle_is_allowed() {
        assert!(NodeState::Pending.can_transition(NodeState::Running));
        assert!(NodeState::Running.can_transition(NodeState::Failed));
        assert!(NodeState::Failed.can_transition(NodeState::Retrying));
        assert!(NodeState::Retrying.can_transition(NodeState::Running));
        assert!(NodeState::Running.can_transition(NodeState::Success));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!NodeState::Pending.can_transition(NodeState::Success));
        assert!(!NodeState::Success.can_transition(NodeState::Running));
        assert!(!NodeState::Failed.can_transition(NodeState::Running));
        assert!(!NodeState::Running.can_transition(NodeState::Retrying));
    }
}
