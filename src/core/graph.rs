//! Task graph definitions.
//!
//! A graph is a set of named nodes with dependency edges. Any acyclic graph
//! is accepted; the standard pipeline is the chain extract -> transform ->
//! load. Graphs can be declared in YAML or built in code.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::node::{EXTRACT, LOAD, TRANSFORM};

use super::limits::RunLimits;

/// A complete graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    /// Graph name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Nodes in declaration order
    pub nodes: Vec<NodeSpec>,
}

impl TaskGraph {
    /// The standard extract -> transform -> load chain
    pub fn etl() -> Self {
        Self {
            name: "real_estate_etl".to_string(),
            description: "Load real-estate sales into the warehouse table".to_string(),
            nodes: vec![
                NodeSpec::new(EXTRACT).with_retries(1),
                NodeSpec::new(TRANSFORM).with_retries(1).after(EXTRACT),
                NodeSpec::new(LOAD).with_retries(3).after(TRANSFORM),
            ],
        }
    }

    /// Parse a graph from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse graph YAML")
    }

    /// Validate names, dependency references and acyclicity
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Graph name cannot be empty");
        }

        if self.nodes.is_empty() {
            anyhow::bail!("Graph must have at least one node");
        }

        let mut names = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.name.is_empty() {
                anyhow::bail!("Node {} has an empty name", i);
            }
            if !names.insert(node.name.as_str()) {
                anyhow::bail!("Duplicate node name '{}'", node.name);
            }
        }

        for node in &self.nodes {
            for dep in &node.depends_on {
                if dep == &node.name {
                    anyhow::bail!("Node '{}' depends on itself", node.name);
                }
                if !names.contains(dep.as_str()) {
                    anyhow::bail!(
                        "Node '{}' depends on non-existent node '{}'",
                        node.name,
                        dep
                    );
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Nodes ordered so every node comes after all of its predecessors.
    ///
    /// Ties keep declaration order, so a chain runs in the order written.
    pub fn topological_order(&self) -> Result<Vec<&NodeSpec>> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let &d = index
                    .get(dep.as_str())
                    .ok_or_else(|| anyhow::anyhow!("Unknown dependency '{}'", dep))?;
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_front() {
            order.push(&self.nodes[i]);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, n)| n.name.as_str())
                .collect();
            anyhow::bail!("Graph contains a cycle through: {}", stuck.join(", "));
        }

        Ok(order)
    }

    /// Get a node by name
    pub fn get_node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Apply per-node overrides from configuration
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, NodeOverride>) {
        for node in &mut self.nodes {
            if let Some(o) = overrides.get(&node.name) {
                o.apply(node);
            }
        }
    }
}

/// A single node in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name (unique within the graph)
    pub name: String,

    /// Nodes that must succeed before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Retry policy for this node
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Override timeout for this node (uses the run limits' node timeout if not set)
    pub timeout_seconds: Option<u64>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout_seconds: None,
        }
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Get the effective timeout for this node
    pub fn timeout(&self, limits: &RunLimits) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(limits.node_timeout_seconds);
        Duration::from_secs(seconds)
    }
}

/// Configuration overrides for one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOverride {
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

impl NodeOverride {
    fn apply(&self, node: &mut NodeSpec) {
        let policy = &mut node.retry_policy;
        if let Some(v) = self.max_retries {
            policy.max_retries = v;
        }
        if let Some(v) = self.initial_delay_ms {
            policy.initial_delay_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            policy.max_delay_ms = v;
        }
        if let Some(v) = self.backoff_multiplier {
            policy.backoff_multiplier = v;
        }
        if self.timeout_seconds.is_some() {
            node.timeout_seconds = self.timeout_seconds;
        }
    }
}

/// Retry policy for failed nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retry)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (1.0 = fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    5000
}
fn default_max_delay() -> u64 {
    300_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy with a constant delay between retries
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_retries,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the given retry (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((retry - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if another retry is allowed after `retries_used` retries
    pub fn should_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIAMOND_YAML: &str = r#"
name: diamond
description: Fan-out and fan-in

nodes:
  - name: a
  - name: b
    depends_on: [a]
  - name: c
    depends_on: [a]
    timeout_seconds: 30
  - name: d
    depends_on: [b, c]
    retry_policy:
      max_retries: 2
      initial_delay_ms: 10
"#;

    #[test]
    fn test_etl_chain_order() {
        let graph = TaskGraph::etl();
        graph.validate().unwrap();

        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["extract", "transform", "load"]);
    }

    #[test]
    fn test_retry_defaults_differ_per_node() {
        let graph = TaskGraph::etl();
        assert_eq!(graph.get_node("extract").unwrap().retry_policy.max_retries, 1);
        assert_eq!(graph.get_node("load").unwrap().retry_policy.max_retries, 3);
    }

    #[test]
    fn test_diamond_parsing() {
        let graph = TaskGraph::from_yaml(DIAMOND_YAML).unwrap();
        graph.validate().unwrap();

        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);

        let d = graph.get_node("d").unwrap();
        assert_eq!(d.retry_policy.max_retries, 2);
        assert_eq!(d.retry_policy.initial_delay_ms, 10);
        assert_eq!(d.retry_policy.max_delay_ms, 300_000);
        assert_eq!(graph.get_node("c").unwrap().timeout_seconds, Some(30));
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
name: cyclic
nodes:
  - name: a
    depends_on: [c]
  - name: b
    depends_on: [a]
  - name: c
    depends_on: [b]
"#;
        let graph = TaskGraph::from_yaml(yaml).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let graph = TaskGraph {
            name: "broken".to_string(),
            description: String::new(),
            nodes: vec![NodeSpec::new("a").after("missing")],
        };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let graph = TaskGraph {
            name: "dup".to_string(),
            description: String::new(),
            nodes: vec![NodeSpec::new("a"), NodeSpec::new("a")],
        };
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut graph = TaskGraph::etl();
        let mut overrides = HashMap::new();
        overrides.insert(
            "load".to_string(),
            NodeOverride {
                max_retries: Some(5),
                timeout_seconds: Some(60),
                ..Default::default()
            },
        );
        graph.apply_overrides(&overrides);

        let load = graph.get_node("load").unwrap();
        assert_eq!(load.retry_policy.max_retries, 5);
        assert_eq!(load.timeout_seconds, Some(60));
        assert_eq!(graph.get_node("extract").unwrap().retry_policy.max_retries, 1);
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_retry(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(250));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }
}
