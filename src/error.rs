use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Required package '{package}' does not exist on the system or is not registered")]
    DependencyMissing { package: String },

    #[error("Workload failed: {command} {arguments} ({reason})")]
    WorkloadFailed {
        command: String,
        arguments: String,
        reason: String,
    },

    #[error("Workload timed out after {timeout:?}: {command} {arguments}")]
    WorkloadTimeout {
        command: String,
        arguments: String,
        timeout: Duration,
    },

    #[error("Failed to start process '{command}' after {attempts} attempt(s): {source}")]
    StartupError {
        command: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer {peer} did not confirm {phase} within {timeout:?}")]
    SynchronizationTimeout {
        peer: String,
        phase: SyncPhase,
        timeout: Duration,
    },

    #[error("Invalid results from {tool}: {reason}")]
    InvalidResults { tool: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("State error for key '{key}': {reason}")]
    State { key: String, reason: String },

    #[error("{} of {} peer flow(s) failed: {}", .failures.len(), .total, summarize(.failures))]
    PeerFlows {
        total: usize,
        failures: Vec<PeerFailure>,
    },

    #[error("Agent API error: {0}")]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Which readiness signal a synchronization phase waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncPhase {
    Heartbeat,
    Online,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Heartbeat => write!(f, "heartbeat"),
            SyncPhase::Online => write!(f, "online signal"),
        }
    }
}

/// A single peer flow's terminal error, kept for the aggregate report.
#[derive(Debug)]
pub struct PeerFailure {
    pub peer: String,
    pub error: Error,
}

fn summarize(failures: &[PeerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.peer, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse error classification used for telemetry and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    DependencyMissing,
    WorkloadFailed,
    WorkloadTimeout,
    StartupError,
    SynchronizationTimeout,
    InvalidResults,
    Cancelled,
    Infrastructure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::DependencyMissing => "DependencyMissing",
            ErrorKind::WorkloadFailed => "WorkloadFailed",
            ErrorKind::WorkloadTimeout => "WorkloadTimeout",
            ErrorKind::StartupError => "StartupError",
            ErrorKind::SynchronizationTimeout => "SynchronizationTimeout",
            ErrorKind::InvalidResults => "InvalidResults",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Infrastructure => "Infrastructure",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            Error::WorkloadFailed { .. } => ErrorKind::WorkloadFailed,
            Error::WorkloadTimeout { .. } => ErrorKind::WorkloadTimeout,
            Error::StartupError { .. } => ErrorKind::StartupError,
            Error::SynchronizationTimeout { .. } => ErrorKind::SynchronizationTimeout,
            Error::InvalidResults { .. } => ErrorKind::InvalidResults,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::PeerFlows { failures, .. } => match failures.as_slice() {
                [only] => only.error.kind(),
                _ => ErrorKind::Infrastructure,
            },
            Error::Config(_)
            | Error::State { .. }
            | Error::Api(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Toml(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether a whole client flow may be attempted again after this error.
    ///
    /// Missing dependencies and invalid results never heal on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WorkloadFailed { .. }
                | Error::StartupError { .. }
                | Error::Api(_)
                | Error::Io(_)
        )
    }

    /// Soft failures degrade a run instead of failing it. Only a timeout of
    /// the measured command itself is treated that way; the same error from
    /// a setup command still fails the flow.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::WorkloadTimeout { .. })
    }
}
