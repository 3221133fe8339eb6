use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::State;
use crate::cleanup::CleanupSummary;
use crate::error::{Error, ErrorKind, Result};
use crate::layout::Role;

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    /// Completed, but at least one flow hit a soft failure.
    Degraded,
    Cancelled,
    Failed,
}

/// What happened to one peer flow (or the single flow of a single-role run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Server endpoint for multi-role client flows.
    pub peer: Option<String>,
    /// Every state the flow passed through, starting at `NotStarted`.
    pub transitions: Vec<State>,
    /// 1-based attempt that produced this record.
    pub attempts: u32,
    pub metrics_emitted: usize,
    /// Soft failures, such as a workload timeout.
    pub warnings: Vec<String>,
    /// Rendered error that failed the flow.
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl FlowRecord {
    pub fn new(peer: Option<String>) -> Self {
        Self {
            peer,
            transitions: Vec::new(),
            attempts: 0,
            metrics_emitted: 0,
            warnings: Vec::new(),
            error: None,
            error_kind: None,
        }
    }

    /// Keeps the message and kind of `error`; the error itself stays with the
    /// run report.
    pub fn record_error(&mut self, error: &Error) {
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind());
    }

    /// Whether the flow ended in `Failed`.
    pub fn failed(&self) -> bool {
        self.transitions.last() == Some(&State::Failed)
    }
}

/// Structured record produced when a run finishes. Every flow's transitions
/// start with the shared initialization phases.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Random v4 UUID.
    pub run_id: String,
    pub workload: String,
    pub role: Option<Role>,
    pub status: RunStatus,
    /// One per server peer in multi-role client runs, otherwise exactly one.
    pub flows: Vec<FlowRecord>,
    pub cleanup: CleanupSummary,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// The error that failed the run. Multi-role failures arrive aggregated
    /// as [`Error::PeerFlows`].
    #[serde(skip)]
    pub error: Option<Error>,
}

impl RunReport {
    /// Metrics emitted across all flows.
    pub fn metrics_emitted(&self) -> usize {
        self.flows.iter().map(|f| f.metrics_emitted).sum()
    }

    /// Splits off the run's error, if any.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(error: Option<Error>) -> RunReport {
        let now = Utc::now();
        let mut first = FlowRecord::new(Some("10.0.0.2:4500".into()));
        first.metrics_emitted = 3;
        first.transitions = vec![State::Initializing, State::Synchronizing, State::Running];
        let mut second = FlowRecord::new(Some("10.0.0.3:4500".into()));
        second.metrics_emitted = 2;
        second.transitions = vec![State::Initializing, State::Synchronizing, State::Failed];

        RunReport {
            run_id: "run-1".into(),
            workload: "sysbench".into(),
            role: Some(Role::Client),
            status: RunStatus::Failed,
            flows: vec![first, second],
            cleanup: CleanupSummary::default(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            error,
        }
    }

    #[test]
    fn metrics_are_summed_across_flows() {
        let report = report(None);
        assert_eq!(report.metrics_emitted(), 5);
        assert!(!report.flows[0].failed());
        assert!(report.flows[1].failed());
    }

    #[test]
    fn into_result_surfaces_error() {
        assert!(report(None).into_result().is_ok());
        let err = report(Some(Error::Cancelled)).into_result().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn record_error_keeps_kind() {
        let mut flow = FlowRecord::new(None);
        flow.record_error(&Error::DependencyMissing { package: "p".into() });
        assert_eq!(flow.error_kind, Some(ErrorKind::DependencyMissing));
        assert!(flow.error.unwrap().contains("'p'"));
    }

    #[test]
    fn report_serializes_without_error_field() {
        let json = serde_json::to_value(report(Some(Error::Cancelled))).unwrap();
        assert_eq!(json["status"], "Failed");
        assert!(json.get("error").is_none());
        assert_eq!(json["flows"][0]["peer"], "10.0.0.2:4500");
    }
}
