//! The interface between the orchestrator and the work a node does.
//!
//! A task body receives the outputs of its predecessors and returns its own
//! artifact, or an error classified as transient (worth retrying) or fatal.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::Artifact;

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried while the node's retry budget lasts
    Transient,
    /// Fails the node on the spot
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure of one node attempt
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct TaskError {
    pub class: ErrorClass,
    pub error: anyhow::Error,
}

impl TaskError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            class: ErrorClass::Transient,
            error: error.into(),
        }
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            error: error.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Everything a node body may look at while it runs
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: Uuid,

    /// Source location given when the run was triggered
    pub source: String,

    pub node: String,

    /// 1 for the first attempt, incremented per retry
    pub attempt: u32,

    /// Where the body may persist diagnostic artifacts
    pub artifacts_dir: PathBuf,

    inputs: HashMap<String, Artifact>,
}

impl NodeContext {
    pub fn new(
        run_id: Uuid,
        source: impl Into<String>,
        node: impl Into<String>,
        attempt: u32,
        artifacts_dir: PathBuf,
        inputs: HashMap<String, Artifact>,
    ) -> Self {
        Self {
            run_id,
            source: source.into(),
            node: node.into(),
            attempt,
            artifacts_dir,
            inputs,
        }
    }

    /// Artifact produced by a predecessor
    pub fn input(&self, node: &str) -> Option<&Artifact> {
        self.inputs.get(node)
    }

    /// Typed payload of a predecessor's artifact.
    ///
    /// A missing or mistyped input is a wiring mistake, so it is fatal.
    pub fn input_payload<T: std::any::Any>(&self, node: &str) -> Result<&T, TaskError> {
        self.input(node)
            .and_then(|a| a.payload::<T>())
            .ok_or_else(|| self.missing_input(node))
    }

    /// Owned handle to a predecessor's payload, e.g. to move into a blocking task
    pub fn shared_input<T: std::any::Any + Send + Sync>(
        &self,
        node: &str,
    ) -> Result<std::sync::Arc<T>, TaskError> {
        self.input(node)
            .and_then(|a| a.shared_payload::<T>())
            .ok_or_else(|| self.missing_input(node))
    }

    fn missing_input(&self, node: &str) -> TaskError {
        TaskError::fatal(anyhow::anyhow!(
            "Node '{}' has no usable input from '{}'",
            self.node,
            node
        ))
    }
}

/// Work performed by one node of the graph
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Human-readable body name
    fn name(&self) -> &str;

    /// Run one attempt
    async fn execute(&self, ctx: &NodeContext) -> Result<Artifact, TaskError>;
}
