//! External process execution.
//!
//! [`ProcessRunner`] launches a [`ProcessRequest`] through a [`ProcessHost`],
//! enforces its timeout, honors cancellation, and hands back a
//! [`ProcessExecution`] with the captured output. Spawning is retried; an
//! already-running process never is.

mod host;
mod runner;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::{CancelSource, CancelToken};
use crate::error::{Error, Result};

pub use host::{TokioProcessHost, split_arguments};
pub use runner::{DEFAULT_START_ATTEMPTS, ProcessRunner};

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn full_command(&self) -> String {
        if self.arguments.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.arguments)
        }
    }
}

/// How a process reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Exited on its own; check the exit code.
    Completed,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Killed because cancellation was requested.
    Cancelled,
}

/// A finished process run. Returned by value; the caller owns the buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecution {
    pub request: ProcessRequest,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub status: ExecutionStatus,
}

impl ProcessExecution {
    pub fn full_command(&self) -> String {
        self.request.full_command()
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ExecutionStatus::Cancelled
    }

    /// Completed on its own with exit code 0.
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.exit_code == Some(0)
    }

    /// Classifies a completed process with a non-zero exit as `WorkloadFailed`.
    ///
    /// Timed-out and cancelled executions are not judged here.
    pub fn ensure_success(&self) -> Result<()> {
        if self.status != ExecutionStatus::Completed || self.exit_code == Some(0) {
            return Ok(());
        }
        let exit = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        let reason = match last_line(&self.stderr) {
            Some(line) => format!("{exit}: {line}"),
            None => exit,
        };
        Err(Error::WorkloadFailed {
            command: self.request.command.clone(),
            arguments: self.request.arguments.clone(),
            reason,
        })
    }

    /// The error value describing this execution's timeout, for logging.
    pub fn timeout_error(&self) -> Option<Error> {
        self.is_timed_out().then(|| Error::WorkloadTimeout {
            command: self.request.command.clone(),
            arguments: self.request.arguments.clone(),
            timeout: self.request.timeout.unwrap_or_default(),
        })
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

/// Exit status and output of a process that has stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Requests termination of a running process. Cheap to clone; safe to call
/// after the process has already exited.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    source: Arc<CancelSource>,
}

impl ProcessKiller {
    /// Returns the killer and the token the process implementation watches.
    pub fn new() -> (Self, CancelToken) {
        let source = Arc::new(CancelSource::new());
        let token = source.token();
        (Self { source }, token)
    }

    pub fn kill(&self) {
        self.source.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.source.is_cancelled()
    }
}

/// A spawned process.
#[async_trait]
pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn killer(&self) -> ProcessKiller;

    /// Waits for exit and collects output. Cancel-safe: dropping the future
    /// before it resolves leaves the process waitable again.
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;
}

/// Creates processes. The production host wraps `tokio::process`.
pub trait ProcessHost: Send + Sync {
    fn spawn(&self, request: &ProcessRequest) -> std::io::Result<Box<dyn RunningProcess>>;
}
