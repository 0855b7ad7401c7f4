//! Artifacts handed from one node to the next.
//!
//! A node's output stays in memory for the rest of the run and is given to
//! every node that depends on it. The payload is typed by the producing
//! node; consumers downcast to the type they expect.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Output of a successful node
#[derive(Clone)]
pub struct Artifact {
    /// Name of the node that produced this artifact
    pub node: String,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Short description for the transition log
    pub summary: String,

    /// Rejected record count, for nodes that filter records
    pub rejected: Option<u64>,

    payload: Arc<dyn Any + Send + Sync>,
}

impl Artifact {
    pub fn new<T: Any + Send + Sync>(node: impl Into<String>, payload: T) -> Self {
        Self {
            node: node.into(),
            created_at: Utc::now(),
            summary: String::new(),
            rejected: None,
            payload: Arc::new(payload),
        }
    }

    /// Artifact for nodes with no meaningful output
    pub fn empty(node: impl Into<String>) -> Self {
        Self::new(node, ())
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_rejected(mut self, rejected: u64) -> Self {
        self.rejected = Some(rejected);
        self
    }

    /// Borrow the payload as `T`, if that is what it holds
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Shared handle to the payload, for work that outlives the borrow
    pub fn shared_payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.payload).downcast::<T>().ok()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("node", &self.node)
            .field("created_at", &self.created_at)
            .field("summary", &self.summary)
            .field("rejected", &self.rejected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_downcast() {
        let artifact = Artifact::new("extract", vec![1u32, 2, 3]).with_summary("3 rows");

        assert_eq!(artifact.node, "extract");
        assert_eq!(artifact.payload::<Vec<u32>>(), Some(&vec![1, 2, 3]));
        assert!(artifact.payload::<String>().is_none());
        assert_eq!(artifact.summary, "3 rows");
    }

    #[test]
    fn test_clone_shares_payload() {
        let artifact = Artifact::new("transform", String::from("rows")).with_rejected(2);
        let copy = artifact.clone();
        assert_eq!(copy.payload::<String>().map(|s| s.as_str()), Some("rows"));
        assert_eq!(copy.rejected, Some(2));
        assert!(Artifact::empty("load").payload::<()>().is_some());
    }

    #[test]
    fn test_shared_payload_outlives_artifact() {
        let artifact = Artifact::new("extract", vec![4u32, 5]);
        let shared = artifact.shared_payload::<Vec<u32>>().unwrap();
        assert!(artifact.shared_payload::<String>().is_none());

        drop(artifact);
        assert_eq!(*shared, vec![4, 5]);
    }
}
