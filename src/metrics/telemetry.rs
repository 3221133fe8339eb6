use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use super::Metric;
use crate::error::Result;

/// Metrics from one result document, with the context they were captured in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    pub tool: String,
    pub scenario: String,
    /// Start of the measured command.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub metrics: Vec<Metric>,
    pub categorization: Option<String>,
    /// Full command line of the measured process.
    pub command_line: String,
    pub tags: BTreeMap<String, String>,
}

/// Destination for captured metrics.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Emits one batch. Errors propagate to the metrics capture step.
    async fn emit(&self, batch: &MetricBatch) -> Result<()>;
}

/// Emits each metric as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

#[async_trait]
impl TelemetrySink for TracingTelemetrySink {
    async fn emit(&self, batch: &MetricBatch) -> Result<()> {
        for metric in &batch.metrics {
            info!(
                target: "fleetbench::metrics",
                tool = %batch.tool,
                scenario = %batch.scenario,
                metric = %metric.name,
                value = metric.value,
                unit = %metric.unit,
                categorization = batch.categorization.as_deref().unwrap_or(""),
                "Metric"
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per batch to a file.
#[derive(Debug)]
pub struct JsonLinesTelemetrySink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesTelemetrySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonLinesTelemetrySink {
    async fn emit(&self, batch: &MetricBatch) -> Result<()> {
        let mut line = serde_json::to_string(batch)?;
        line.push('\n');

        // One append at a time across concurrent flows.
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(tool: &str) -> MetricBatch {
        let now = Utc::now();
        MetricBatch {
            tool: tool.into(),
            scenario: "OLTP".into(),
            start: now,
            end: now,
            metrics: vec![Metric::new("transactions/sec", 10.0, "transactions/sec")],
            categorization: None,
            command_line: "sysbench oltp_read_write run".into(),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn json_lines_appends_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/metrics.jsonl");
        let sink = JsonLinesTelemetrySink::new(&path);

        sink.emit(&batch("a")).await.unwrap();
        sink.emit(&batch("b")).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<MetricBatch> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].tool, "a");
        assert_eq!(lines[1].tool, "b");
        assert_eq!(lines[1].command_line, "sysbench oltp_read_write run");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flows_write_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let sink = std::sync::Arc::new(JsonLinesTelemetrySink::new(&path));

        let emits = (0..16).map(|i| {
            let sink = sink.clone();
            tokio::spawn(async move { sink.emit(&batch(&format!("flow-{i}"))).await })
        });
        for result in futures::future::join_all(emits).await {
            result.unwrap().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let tools: std::collections::HashSet<String> = contents
            .lines()
            .map(|l| serde_json::from_str::<MetricBatch>(l).unwrap().tool)
            .collect();
        assert_eq!(tools.len(), 16);
    }

    #[tokio::test]
    async fn tracing_sink_never_fails() {
        TracingTelemetrySink.emit(&batch("x")).await.unwrap();
    }
}
