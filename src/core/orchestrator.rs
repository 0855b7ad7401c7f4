//! Main orchestrator for task graph execution.
//!
//! Walks the graph in dependency order, drives each node through its state
//! machine, retries transient failures with backoff, enforces timeouts and
//! run limits, and records every transition in the run's log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::domain::{Artifact, Event, EventType, NodeState, Run, RunState};

use super::event_store::{RunLog, RunStore};
use super::graph::{NodeSpec, TaskGraph};
use super::limits::{RunLimits, RunTracker};
use super::task::{NodeContext, TaskBody, TaskError};

/// Handle to a run executing in the background
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<Result<Run>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation; honored at the next node boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<Run> {
        self.join.await.context("Run task panicked")?
    }
}

/// Task graph orchestrator
pub struct Orchestrator {
    store: RunStore,
    graph: TaskGraph,
    limits: RunLimits,
    bodies: HashMap<String, Arc<dyn TaskBody>>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Orchestrator {
    /// Create an orchestrator with no task bodies registered
    pub fn new(store: RunStore, graph: TaskGraph, limits: RunLimits) -> Self {
        Self {
            store,
            graph,
            limits,
            bodies: HashMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the body that runs for `node`
    pub fn register(mut self, node: impl Into<String>, body: Arc<dyn TaskBody>) -> Self {
        self.bodies.insert(node.into(), body);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Check the graph is acyclic and every node has a body
    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        for node in &self.graph.nodes {
            if !self.bodies.contains_key(&node.name) {
                anyhow::bail!("No task body registered for node '{}'", node.name);
            }
        }
        Ok(())
    }

    /// Start a new run reading from `source`
    #[instrument(skip(self, source), fields(graph = %self.graph.name))]
    pub async fn trigger_run(self: &Arc<Self>, source: impl Into<String>) -> Result<RunHandle> {
        let source = source.into();
        let summary = format!("Graph '{}' triggered for {}", self.graph.name, source);
        self.start(Uuid::new_v4(), source, summary).await
    }

    /// Start a new run and wait for it to finish
    pub async fn run_pipeline(self: &Arc<Self>, source: impl Into<String>) -> Result<Run> {
        self.trigger_run(source).await?.wait().await
    }

    /// Re-execute a failed or interrupted run under the same id.
    ///
    /// Every node runs again from Pending; the loader's commit makes this
    /// safe for runs that already reached the warehouse. Succeeded runs are
    /// refused.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn resume_run(self: &Arc<Self>, run_id: Uuid) -> Result<RunHandle> {
        let previous = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Run {} not found", run_id))?;

        if previous.state == RunState::Success {
            anyhow::bail!("Run {} already succeeded", run_id);
        }
        if previous.source.is_empty() {
            anyhow::bail!("Run {} has no recorded source", run_id);
        }

        info!(source = %previous.source, "Resuming run");
        let summary = format!("Graph '{}' resumed", self.graph.name);
        self.start(run_id, previous.source, summary).await
    }

    /// Request cancellation of a run executing in this process
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(&run_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    async fn start(self: &Arc<Self>, run_id: Uuid, source: String, summary: String) -> Result<RunHandle> {
        self.validate()?;

        let cancel = CancellationToken::new();
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| anyhow::anyhow!("Active run registry poisoned"))?;
            if active.contains_key(&run_id) {
                anyhow::bail!("Run {} is already executing", run_id);
            }
            active.insert(run_id, cancel.clone());
        }

        let started = async {
            let log = self.store.open(run_id).await?;
            let event = Event::run(run_id, EventType::RunStarted, summary)
                .with_source(source.clone());
            log.append(&event).await?;
            Ok::<_, anyhow::Error>(log)
        }
        .await;

        let log = match started {
            Ok(log) => log,
            Err(e) => {
                self.deactivate(run_id);
                return Err(e);
            }
        };

        info!(%run_id, %source, "Run started");
        let run = Run::new(
            run_id,
            source,
            self.graph.nodes.iter().map(|n| n.name.clone()),
        );

        let this = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(
            async move {
                let result = this.execute(run, &log, &token).await;
                this.deactivate(run_id);
                result
            }
            .instrument(tracing::info_span!("run", %run_id)),
        );

        Ok(RunHandle {
            run_id,
            cancel,
            join,
        })
    }

    fn deactivate(&self, run_id: Uuid) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&run_id);
        }
    }

    async fn execute(&self, mut run: Run, log: &RunLog, cancel: &CancellationToken) -> Result<Run> {
        let order: Vec<NodeSpec> = self
            .graph
            .topological_order()?
            .into_iter()
            .cloned()
            .collect();

        let tracker = RunTracker::new();
        let mut artifacts: HashMap<String, Artifact> = HashMap::new();

        for spec in &order {
            if cancel.is_cancelled() {
                warn!(node = %spec.name, "Run cancelled");
                return self
                    .fail_pending(log, &mut run, &spec.name, "cancelled".to_string())
                    .await;
            }

            if let Err(violation) = self.limits.check(&tracker) {
                error!(%violation, "Run limit reached");
                return self
                    .fail_pending(log, &mut run, &spec.name, violation.to_string())
                    .await;
            }

            let mut inputs = HashMap::new();
            for dep in &spec.depends_on {
                match artifacts.get(dep) {
                    Some(artifact) if run.node_state(dep) == Some(NodeState::Success) => {
                        inputs.insert(dep.clone(), artifact.clone());
                    }
                    _ => {
                        let e = anyhow::anyhow!(
                            "Node '{}' started before dependency '{}' succeeded",
                            spec.name,
                            dep
                        );
                        return self.handle_run_failure(log, &mut run, e).await;
                    }
                }
            }

            match self
                .execute_node_with_retry(log, &mut run, spec, inputs, cancel)
                .await
            {
                Ok(artifact) => {
                    artifacts.insert(spec.name.clone(), artifact);
                }
                Err(e) => return self.handle_run_failure(log, &mut run, e).await,
            }
        }

        self.complete_run(log, &mut run).await
    }

    /// Drive one node to Success or terminal Failed
    async fn execute_node_with_retry(
        &self,
        log: &RunLog,
        run: &mut Run,
        spec: &NodeSpec,
        inputs: HashMap<String, Artifact>,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let body = self
            .bodies
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No task body registered for node '{}'", spec.name))?;
        let timeout = spec.timeout(&self.limits);
        let policy = &spec.retry_policy;
        let mut retries = 0u32;

        loop {
            let attempt = retries + 1;
            let event = transition(run, &spec.name, NodeState::Running, format!("Attempt {}", attempt))?;
            log.append(&event).await?;

            let ctx = NodeContext::new(
                run.id,
                run.source.clone(),
                spec.name.clone(),
                attempt,
                log.artifacts_dir().to_path_buf(),
                inputs.clone(),
            );

            let span = tracing::info_span!("node", node = %spec.name, body = body.name(), attempt);
            let node_start = Instant::now();
            let result = match tokio::time::timeout(timeout, body.execute(&ctx).instrument(span)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::transient(anyhow::anyhow!(
                    "Node '{}' timed out after {}s",
                    spec.name,
                    timeout.as_secs()
                ))),
            };
            let duration_ms = node_start.elapsed().as_millis() as u64;

            let err = match result {
                Ok(artifact) => {
                    let summary = if artifact.summary.is_empty() {
                        format!("Completed in {}ms", duration_ms)
                    } else {
                        artifact.summary.clone()
                    };
                    let mut event = transition(run, &spec.name, NodeState::Success, summary)?
                        .with_duration(duration_ms);
                    if let Some(rejected) = artifact.rejected {
                        run.rejected_records = Some(rejected);
                        event = event.with_rejected(rejected);
                    }
                    log.append(&event).await?;

                    info!(node = %spec.name, attempt, duration_ms, "Node succeeded");
                    return Ok(artifact);
                }
                Err(err) => err,
            };

            let event = transition(
                run,
                &spec.name,
                NodeState::Failed,
                format!("Attempt {} failed ({})", attempt, err.class),
            )?
            .with_duration(duration_ms)
            .with_error(err.to_string());
            log.append(&event).await?;

            if !(err.is_transient() && policy.should_retry(retries)) {
                error!(
                    node = %spec.name,
                    attempt,
                    class = %err.class,
                    error = %err,
                    "Node failed permanently"
                );
                return Err(anyhow::anyhow!(
                    "Node '{}' failed after {} attempt(s): {}",
                    spec.name,
                    attempt,
                    err
                ));
            }

            retries += 1;
            let delay = policy.delay_for_retry(retries);
            let event = transition(
                run,
                &spec.name,
                NodeState::Retrying,
                format!(
                    "Retry {} of {} in {}ms",
                    retries,
                    policy.max_retries,
                    delay.as_millis()
                ),
            )?;
            log.append(&event).await?;

            warn!(
                node = %spec.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Node failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    let event = transition(
                        run,
                        &spec.name,
                        NodeState::Failed,
                        "Cancelled during backoff".to_string(),
                    )?
                    .with_error("cancelled".to_string());
                    log.append(&event).await?;
                    anyhow::bail!("Run cancelled while '{}' was waiting to retry", spec.name);
                }
            }
        }
    }

    /// Fail a node that never started, then the run
    async fn fail_pending(
        &self,
        log: &RunLog,
        run: &mut Run,
        node: &str,
        reason: String,
    ) -> Result<Run> {
        let event = transition(run, node, NodeState::Failed, format!("Not started: {}", reason))?
            .with_error(reason.clone());
        log.append(&event).await?;

        let e = anyhow::anyhow!("Run stopped before '{}': {}", node, reason);
        self.handle_run_failure(log, run, e).await
    }

    /// Handle a run failure
    async fn handle_run_failure(
        &self,
        log: &RunLog,
        run: &mut Run,
        error: anyhow::Error,
    ) -> Result<Run> {
        let error_msg = error.to_string();
        error!(run_id = %run.id, %error_msg, "Run failed");

        run.state = RunState::Failed {
            error: error_msg.clone(),
        };
        run.completed_at = Some(chrono::Utc::now());

        let mut event = Event::run(
            run.id,
            EventType::RunFailed,
            format!("Run failed: {}", error_msg),
        )
        .with_error(error_msg);
        if let Some(rejected) = run.rejected_records {
            event = event.with_rejected(rejected);
        }
        log.append(&event).await?;

        Ok(run.clone())
    }

    /// Complete a successful run
    async fn complete_run(&self, log: &RunLog, run: &mut Run) -> Result<Run> {
        info!(
            run_id = %run.id,
            rejected = run.rejected_records.unwrap_or(0),
            "Run completed successfully"
        );

        run.state = RunState::Success;
        run.completed_at = Some(chrono::Utc::now());

        let mut event = Event::run(
            run.id,
            EventType::RunCompleted,
            format!("Graph '{}' completed", self.graph.name),
        );
        if let Some(rejected) = run.rejected_records {
            event = event.with_rejected(rejected);
        }
        log.append(&event).await?;

        Ok(run.clone())
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<Run> {
        let mut run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Run {} not found", run_id))?;

        // Nodes that never transitioned are still Pending
        for node in &self.graph.nodes {
            run.nodes.entry(node.name.clone()).or_insert(NodeState::Pending);
        }

        Ok(run)
    }

    /// The full transition log of a run
    pub async fn transition_log(&self, run_id: Uuid) -> Result<Vec<Event>> {
        if !self.store.contains(run_id) {
            anyhow::bail!("Run {} not found", run_id);
        }
        self.store.open(run_id).await?.replay().await
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let run_ids = self.store.list_runs().await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match self.get_run_status(run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => debug!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }
}

/// Apply a node transition to the run and build its log event
fn transition(run: &mut Run, node: &str, to: NodeState, summary: String) -> Result<Event> {
    let from = run.transition(node, to)?;
    debug!(node, %from, %to, "Node transition");
    Ok(Event::transition(run.id, node, from, to, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{NodeSpec, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskBody for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, ctx: &NodeContext) -> Result<Artifact, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TaskError::transient(anyhow::anyhow!("try again")));
            }
            Ok(Artifact::new(ctx.node.clone(), ctx.attempt))
        }
    }

    fn single_node(retries: u32) -> TaskGraph {
        TaskGraph {
            name: "single".to_string(),
            description: String::new(),
            nodes: vec![NodeSpec::new("only")
                .with_retry_policy(RetryPolicy::fixed(retries, Duration::from_millis(1)))],
        }
    }

    #[tokio::test]
    async fn test_missing_body_rejected() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            RunStore::new(temp.path()),
            single_node(0),
            RunLimits::default(),
        ));

        assert!(orchestrator.validate().is_err());
        assert!(orchestrator.trigger_run("/src.csv").await.is_err());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Arc::new(
            Orchestrator::new(RunStore::new(temp.path()), single_node(2), RunLimits::default())
                .register(
                    "only",
                    Arc::new(Flaky {
                        failures: 1,
                        calls: AtomicU32::new(0),
                    }),
                ),
        );

        let run = orchestrator.run_pipeline("/src.csv").await.unwrap();
        assert_eq!(run.state, RunState::Success);
        assert_eq!(run.attempts.get("only"), Some(&2));

        let status = orchestrator.get_run_status(run.id).await.unwrap();
        assert_eq!(status.state, RunState::Success);
        assert_eq!(status.node_state("only"), Some(NodeState::Success));
        assert_eq!(status.source, "/src.csv");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Arc::new(
            Orchestrator::new(RunStore::new(temp.path()), single_node(1), RunLimits::default())
                .register(
                    "only",
                    Arc::new(Flaky {
                        failures: 5,
                        calls: AtomicU32::new(0),
                    }),
                ),
        );

        let run = orchestrator.run_pipeline("/src.csv").await.unwrap();
        assert!(matches!(run.state, RunState::Failed { .. }));
        assert_eq!(run.node_state("only"), Some(NodeState::Failed));
        assert_eq!(run.attempts.get("only"), Some(&2));
    }

    #[tokio::test]
    async fn test_list_runs() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Arc::new(
            Orchestrator::new(RunStore::new(temp.path()), single_node(0), RunLimits::default())
                .register(
                    "only",
                    Arc::new(Flaky {
                        failures: 0,
                        calls: AtomicU32::new(0),
                    }),
                ),
        );

        let first = orchestrator.run_pipeline("/a.csv").await.unwrap();
        let second = orchestrator.run_pipeline("/b.csv").await.unwrap();

        let runs = orchestrator.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].id, first.id);
        assert_eq!(orchestrator.list_runs(1).await.unwrap().len(), 1);
    }
}
