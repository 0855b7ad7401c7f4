//! Run-level limits.
//!
//! Bounds a run by wall-clock time and by the share of rows the transform
//! stage may reject before the data is considered unusable.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to every run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    /// Reject ratio above which the transform stage fails (None = never)
    #[serde(default)]
    pub max_rejection_ratio: Option<f64>,

    /// Default per-node timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_node_timeout")]
    pub node_timeout_seconds: u64,

    /// Total run timeout in seconds, checked between nodes (default: 3600)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
}

fn default_node_timeout() -> u64 {
    300
} // 5 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_rejection_ratio: None,
            node_timeout_seconds: default_node_timeout(),
            run_timeout_seconds: default_run_timeout(),
        }
    }
}

impl RunLimits {
    /// Check a rejection tally against the configured threshold
    pub fn check_rejections(&self, rejected: u64, total: u64) -> Result<(), LimitViolation> {
        let Some(limit) = self.max_rejection_ratio else {
            return Ok(());
        };
        if total == 0 {
            return Ok(());
        }

        let ratio = rejected as f64 / total as f64;
        if ratio > limit {
            return Err(LimitViolation::RejectionThreshold {
                rejected,
                total,
                ratio,
                limit,
            });
        }
        Ok(())
    }

    /// Check current tracker state against limits
    pub fn check(&self, tracker: &RunTracker) -> Result<(), LimitViolation> {
        let elapsed = tracker.elapsed_seconds();
        if elapsed >= self.run_timeout_seconds {
            return Err(LimitViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }
        Ok(())
    }
}

/// Wall clock of a run for limit checks
#[derive(Debug, Clone)]
pub struct RunTracker {
    /// When the run started
    pub started_at: Instant,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Limit violations
#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Rejection threshold exceeded: {rejected}/{total} rows ({ratio:.3} > {limit:.3})")]
    RejectionThreshold {
        rejected: u64,
        total: u64,
        ratio: f64,
        limit: f64,
    },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = RunLimits::default();
        assert_eq!(limits.max_rejection_ratio, None);
        assert_eq!(limits.node_timeout_seconds, 300);
        assert_eq!(limits.run_timeout_seconds, 3600);
    }

    #[test]
    fn test_no_threshold_always_passes() {
        let limits = RunLimits::default();
        assert!(limits.check_rejections(99, 100).is_ok());
    }

    #[test]
    fn test_rejection_threshold() {
        let limits = RunLimits {
            max_rejection_ratio: Some(0.5),
            ..Default::default()
        };

        assert!(limits.check_rejections(1, 2).is_ok());
        let result = limits.check_rejections(2, 3);
        assert!(matches!(
            result,
            Err(LimitViolation::RejectionThreshold { rejected: 2, total: 3, .. })
        ));
        assert!(limits.check_rejections(0, 0).is_ok());
    }

    #[test]
    fn test_run_timeout() {
        let limits = RunLimits {
            run_timeout_seconds: 0,
            ..Default::default()
        };
        let tracker = RunTracker::new();
        assert!(matches!(
            limits.check(&tracker),
            Err(LimitViolation::RunTimeout { .. })
        ));

        assert!(RunLimits::default().check(&tracker).is_ok());
    }

    #[test]
    fn test_tracker_measures_wall_clock_only() {
        let started_at = Instant::now()
            .checked_sub(std::time::Duration::from_secs(5))
            .unwrap();
        let tracker = RunTracker { started_at };
        assert!(tracker.elapsed_seconds() >= 5);

        let limits = RunLimits {
            run_timeout_seconds: 5,
            ..Default::default()
        };
        assert!(matches!(
            limits.check(&tracker),
            Err(LimitViolation::RunTimeout { limit_seconds: 5, .. })
        ));
    }
}
