//! Structured measurements and the path from raw tool output to telemetry.

mod artifacts;
mod pipeline;
mod telemetry;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use artifacts::{ArchiveTarget, ArtifactSink, BlobDescriptor, DirectoryArtifactSink};
pub use pipeline::MetricsPipeline;
pub use telemetry::{JsonLinesTelemetrySink, MetricBatch, TelemetrySink, TracingTelemetrySink};

#[cfg(test)]
pub(crate) use pipeline::testing;

/// A single measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    /// Free-form unit, e.g. `Score` or `milliseconds`.
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categorization: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Execution window; stamped by the pipeline.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            categorization: None,
            tags: BTreeMap::new(),
            start: None,
            end: None,
        }
    }

    /// Adds one tag, replacing any previous value under `key`.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Labels attached to every metric and batch of one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsContext {
    pub tool: String,
    pub scenario: String,
    pub categorization: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl MetricsContext {
    pub fn new(tool: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            scenario: scenario.into(),
            ..Default::default()
        }
    }

    pub fn categorization(mut self, categorization: impl Into<String>) -> Self {
        self.categorization = Some(categorization.into());
        self
    }

    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// Raised by a parser that cannot make sense of its input.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Turns one raw result document into metrics.
///
/// Parsing must be deterministic: the same input always yields the same
/// metrics in the same order.
pub trait MetricsParser: Send + Sync {
    /// Fails with [`ParseError`] when `raw` is not the tool's output at all.
    fn parse(&self, raw: &str) -> Result<Vec<Metric>, ParseError>;
}
