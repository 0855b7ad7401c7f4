//! Node bodies for the standard extract -> transform -> load graph.
//!
//! Each body is stateless between attempts: extract re-reads the source,
//! transform reprocesses its input, load re-runs its idempotent commit.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::core::limits::RunLimits;
use crate::core::task::{NodeContext, TaskBody, TaskError};
use crate::domain::node::{EXTRACT, TRANSFORM};
use crate::domain::{Artifact, RawRecord};

use super::extract::Extractor;
use super::load::{LoadOutcome, Loader};
use super::transform::{to_csv, transform_all, SaleIdCounter, TransformOutput};

/// Name of the cleaned copy kept with each run's artifacts
pub const CLEANED_ARTIFACT: &str = "transform.csv";

/// Reads the run's source file
#[derive(Debug, Clone)]
pub struct ExtractTask {
    delimiter: u8,
}

impl ExtractTask {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Default for ExtractTask {
    fn default() -> Self {
        Self::new(b',')
    }
}

#[async_trait]
impl TaskBody for ExtractTask {
    fn name(&self) -> &str {
        "extract"
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<Artifact, TaskError> {
        let extractor = Extractor::new(&ctx.source).with_delimiter(self.delimiter);

        let rows: Vec<RawRecord> = tokio::task::spawn_blocking(move || extractor.read_all())
            .await
            .map_err(|e| TaskError::fatal(anyhow!("Extract worker failed: {}", e)))?
            .map_err(TaskError::fatal)?;

        info!(rows = rows.len(), source = %ctx.source, "Source extracted");
        let summary = format!("Extracted {} rows from {}", rows.len(), ctx.source);
        Ok(Artifact::new(ctx.node.clone(), rows).with_summary(summary))
    }
}

/// Normalizes extracted rows and enforces the rejection threshold
#[derive(Debug, Clone)]
pub struct TransformTask {
    sale_id_base: u64,
    limits: RunLimits,
    keep_cleaned_copy: bool,
}

impl TransformTask {
    pub fn new(sale_id_base: u64, limits: RunLimits) -> Self {
        Self {
            sale_id_base,
            limits,
            keep_cleaned_copy: true,
        }
    }

    /// Whether to write the cleaned CSV into the run's artifacts
    pub fn keep_cleaned_copy(mut self, keep: bool) -> Self {
        self.keep_cleaned_copy = keep;
        self
    }
}

impl Default for TransformTask {
    fn default() -> Self {
        Self::new(1, RunLimits::default())
    }
}

#[async_trait]
impl TaskBody for TransformTask {
    fn name(&self) -> &str {
        "transform"
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<Artifact, TaskError> {
        let rows = ctx.shared_input::<Vec<RawRecord>>(EXTRACT)?;
        let total = rows.len() as u64;

        // Fresh counter per attempt so a retry reproduces the same ids
        let sale_id_base = self.sale_id_base;
        let keep_cleaned_copy = self.keep_cleaned_copy;
        let (output, cleaned) = tokio::task::spawn_blocking(move || {
            let mut counter = SaleIdCounter::new(sale_id_base);
            let output = transform_all(rows.iter(), &mut counter);
            let cleaned = if keep_cleaned_copy {
                Some(to_csv(&output.records))
            } else {
                None
            };
            (output, cleaned)
        })
        .await
        .map_err(|e| TaskError::fatal(anyhow!("Transform worker failed: {}", e)))?;

        let rejected = output.rejections.total;
        info!(
            accepted = output.records.len(),
            rejected,
            "Records normalized"
        );
        for (line, reason) in &output.rejections.samples {
            debug!(line, %reason, "Record rejected");
        }

        self.limits
            .check_rejections(rejected, total)
            .map_err(TaskError::fatal)?;

        if let Some(csv) = cleaned {
            let csv = csv.map_err(TaskError::fatal)?;
            let path = ctx.artifacts_dir.join(CLEANED_ARTIFACT);
            tokio::fs::write(&path, csv).await.map_err(|e| {
                TaskError::transient(anyhow!("Failed to write {}: {}", path.display(), e))
            })?;
        }

        let summary = format!(
            "Normalized {} of {} rows; {}",
            output.records.len(),
            total,
            output.rejections
        );
        Ok(Artifact::new(ctx.node.clone(), output)
            .with_summary(summary)
            .with_rejected(rejected))
    }
}

/// Commits normalized records to the warehouse
pub struct LoadTask {
    loader: Arc<Loader>,
}

impl LoadTask {
    pub fn new(loader: Arc<Loader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl TaskBody for LoadTask {
    fn name(&self) -> &str {
        "load"
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<Artifact, TaskError> {
        let output = ctx.input_payload::<TransformOutput>(TRANSFORM)?;

        let report = self
            .loader
            .load(ctx.run_id, &output.records)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    TaskError::transient(e)
                } else {
                    TaskError::fatal(e)
                }
            })?;

        let summary = match report.outcome {
            LoadOutcome::Committed => {
                format!("Committed {} rows to {}", report.rows, report.location)
            }
            LoadOutcome::AlreadyCommitted => {
                format!("{} already holds this run's {} rows", report.location, report.rows)
            }
        };
        Ok(Artifact::new(ctx.node.clone(), report).with_summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn raw(line: u64, town: &str) -> RawRecord {
        RawRecord {
            line,
            list_year: "2006".to_string(),
            town: town.to_string(),
            address: "1 Elm St".to_string(),
            assessed_value: "100".to_string(),
            sale_amount: "200".to_string(),
            sales_ratio: "0.5".to_string(),
            property_type: "Residential".to_string(),
            residential_type: String::new(),
        }
    }

    fn ctx_with_rows(dir: PathBuf, rows: Vec<RawRecord>) -> NodeContext {
        let mut inputs = HashMap::new();
        inputs.insert(EXTRACT.to_string(), Artifact::new(EXTRACT, rows));
        NodeContext::new(Uuid::new_v4(), "/in.csv", TRANSFORM, 1, dir, inputs)
    }

    #[tokio::test]
    async fn test_transform_writes_cleaned_copy() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx_with_rows(temp.path().to_path_buf(), vec![raw(1, "Avon"), raw(2, "")]);

        let task = TransformTask::default();
        assert_eq!(task.name(), "transform");

        let artifact = task.execute(&ctx).await.unwrap();
        assert_eq!(artifact.rejected, Some(1));

        let output = artifact.payload::<TransformOutput>().unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].sale_id, 1);

        let cleaned = std::fs::read_to_string(temp.path().join(CLEANED_ARTIFACT)).unwrap();
        assert!(cleaned.contains("Avon"));
    }

    #[tokio::test]
    async fn test_rejection_threshold_is_fatal() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx_with_rows(temp.path().to_path_buf(), vec![raw(1, ""), raw(2, "")]);
        let limits = RunLimits {
            max_rejection_ratio: Some(0.5),
            ..Default::default()
        };

        let err = TransformTask::new(1, limits)
            .execute(&ctx)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Rejection threshold"));
    }

    #[tokio::test]
    async fn test_extract_missing_source_is_fatal() {
        let ctx = NodeContext::new(
            Uuid::new_v4(),
            "/no/such/file.csv",
            EXTRACT,
            1,
            PathBuf::from("/tmp"),
            HashMap::new(),
        );

        let err = ExtractTask::default().execute(&ctx).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Source unavailable"));
    }
}
