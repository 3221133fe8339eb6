use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ArchiveTarget, ArtifactSink, BlobDescriptor, Metric, MetricBatch, MetricsContext, MetricsParser, TelemetrySink};
use crate::error::{Error, Result};
use crate::process::{ExecutionStatus, ProcessExecution};

/// Parses captured results, emits them to telemetry, and archives artifacts.
#[derive(Clone)]
pub struct MetricsPipeline {
    telemetry: Arc<dyn TelemetrySink>,
    artifacts: Option<(Arc<dyn ArtifactSink>, ArchiveTarget)>,
}

impl MetricsPipeline {
    pub fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            telemetry,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, sink: Arc<dyn ArtifactSink>, target: ArchiveTarget) -> Self {
        self.artifacts = Some((sink, target));
        self
    }

    /// Parses each result document and emits one batch per document.
    ///
    /// Executions that did not complete, and documents that are empty, yield
    /// no metrics. A parser failure is [`Error::InvalidResults`].
    pub async fn capture(
        &self,
        execution: &ProcessExecution,
        raw_results: &[String],
        parser: &dyn MetricsParser,
        context: &MetricsContext,
    ) -> Result<Vec<Metric>> {
        if execution.status != ExecutionStatus::Completed {
            debug!(status = ?execution.status, tool = %context.tool, "Skipping metrics for incomplete execution");
            return Ok(Vec::new());
        }

        let mut captured = Vec::new();
        for raw in raw_results {
            if raw.trim().is_empty() {
                debug!(tool = %context.tool, "Result document is empty, no metrics");
                continue;
            }

            let parsed = parser.parse(raw).map_err(|e| Error::InvalidResults {
                tool: context.tool.clone(),
                reason: e.to_string(),
            })?;
            if parsed.is_empty() {
                continue;
            }

            let metrics: Vec<Metric> = parsed
                .into_iter()
                .map(|metric| stamp(metric, execution, context))
                .collect();

            let batch = MetricBatch {
                tool: context.tool.clone(),
                scenario: context.scenario.clone(),
                start: execution.started_at,
                end: execution.ended_at,
                metrics,
                categorization: context.categorization.clone(),
                command_line: execution.full_command(),
                tags: context.tags.clone(),
            };
            self.telemetry.emit(&batch).await?;
            info!(
                tool = %batch.tool,
                scenario = %batch.scenario,
                count = batch.metrics.len(),
                "Metrics captured"
            );
            captured.extend(batch.metrics);
        }

        Ok(captured)
    }

    /// Uploads `files` under `folder`. Failures are logged, never returned.
    /// Returns how many files were uploaded.
    pub async fn archive(&self, files: &[PathBuf], folder: &str) -> usize {
        let Some((sink, target)) = &self.artifacts else {
            debug!(folder, files = files.len(), "No artifact sink configured, skipping upload");
            return 0;
        };

        let mut uploaded = 0;
        for (source, blob) in BlobDescriptor::for_files(target, folder, files) {
            match sink.upload(&source, &blob).await {
                Ok(()) => uploaded += 1,
                Err(e) => warn!(
                    source = %source.display(),
                    blob = %blob.blob_path(),
                    error = %e,
                    "Artifact upload failed"
                ),
            }
        }
        uploaded
    }
}

fn stamp(mut metric: Metric, execution: &ProcessExecution, context: &MetricsContext) -> Metric {
    metric.start = Some(execution.started_at);
    metric.end = Some(execution.ended_at);
    if metric.categorization.is_none() {
        metric.categorization = context.categorization.clone();
    }
    for (key, value) in &context.tags {
        metric.tags.entry(key.clone()).or_insert_with(|| value.clone());
    }
    metric
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Telemetry sink that keeps every batch in memory.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        batches: Mutex<Vec<MetricBatch>>,
    }

    impl RecordingSink {
        pub fn batches(&self) -> Vec<MetricBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn emit(&self, batch: &MetricBatch) -> Result<()> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }
}
