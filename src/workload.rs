//! The capability interface every benchmark variant implements.
//!
//! The engine owns the lifecycle; a [`Workload`] only answers what to set up,
//! what to run, and how to read the results.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::cleanup::CleanupRegistry;
use crate::clock::Clock;
use crate::error::Result;
use crate::layout::{ClientInstance, Role};
use crate::metrics::{MetricsContext, MetricsParser};
use crate::packages::PackagePath;
use crate::process::{ProcessExecution, ProcessRequest, ProcessRunner};
use crate::state::StateStore;

/// Which workload this is, in which role, needing which package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub name: String,
    /// `None` for single-role workloads.
    pub role: Option<Role>,
    /// Package name handed to the [`crate::packages::PackageResolver`].
    pub package: String,
}

impl WorkloadIdentity {
    pub fn new(name: impl Into<String>, role: Option<Role>, package: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            package: package.into(),
        }
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Some(role) => write!(f, "{} ({role})", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Services available to a workload while it sets up and prepares.
#[derive(Clone)]
pub struct WorkloadContext {
    /// Shares the run's cleanup registry, so started processes are killed
    /// at cleanup.
    pub runner: ProcessRunner,
    pub state: StateStore,
    pub cleanup: CleanupRegistry,
    pub clock: Arc<dyn Clock>,
}

impl WorkloadContext {
    /// Runs a setup command and fails unless it exits cleanly.
    ///
    /// Timeouts and cancellation are reported as errors here: setup steps
    /// cannot be skipped the way a measured run can.
    pub async fn run_checked(&self, request: &ProcessRequest, cancel: &CancelToken) -> Result<ProcessExecution> {
        let execution = self.runner.run(request, cancel).await?;
        if execution.is_cancelled() {
            return Err(crate::error::Error::Cancelled);
        }
        if let Some(timeout) = execution.timeout_error() {
            return Err(timeout);
        }
        execution.ensure_success()?;
        Ok(execution)
    }
}

/// A benchmark the engine can drive: what to install, what to run and how
/// to read its results.
///
/// Only [`initialize`](Self::initialize), [`command`](Self::command) and the
/// metrics hooks are required. The defaults read results from standard
/// output and archive nothing.
#[async_trait]
pub trait Workload: Send + Sync {
    fn identity(&self) -> &WorkloadIdentity;

    /// One-time setup once the package is resolved. Guard anything that
    /// must not repeat across runs with [`StateStore::run_once`].
    async fn initialize(
        &self,
        ctx: &WorkloadContext,
        package: &PackagePath,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Work done in each flow before the measured command, such as database
    /// preparation against `peer`.
    async fn prepare(
        &self,
        _ctx: &WorkloadContext,
        _package: &PackagePath,
        _peer: Option<&ClientInstance>,
        _cancel: &CancelToken,
    ) -> Result<()> {
        Ok(())
    }

    /// The measured command.
    fn command(&self, package: &PackagePath, peer: Option<&ClientInstance>) -> Result<ProcessRequest>;

    /// Parser for one result document.
    fn metrics_parser(&self) -> Box<dyn MetricsParser>;

    /// Tool, scenario and tags for the metrics of a flow against `peer`.
    fn metrics_context(&self, peer: Option<&ClientInstance>) -> MetricsContext;

    /// Raw result documents for a completed run. Defaults to standard output.
    async fn collect_results(
        &self,
        execution: &ProcessExecution,
        _package: &PackagePath,
    ) -> Result<Vec<String>> {
        Ok(vec![execution.stdout.clone()])
    }

    /// Called after results were captured successfully.
    async fn results_captured(&self, _package: &PackagePath) -> Result<()> {
        Ok(())
    }

    /// Files to archive after a successful capture.
    fn artifacts(&self, _package: &PackagePath) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    /// Blob folder the artifacts are archived under.
    fn artifact_folder(&self) -> &str {
        &self.identity().name
    }

    /// Attempts per flow when the workload has its own retry budget.
    /// `None` falls back to the engine's flow policy.
    fn flow_attempts(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::Error;
    use crate::process::testing::{Script, ScriptedHost};
    use std::time::Duration;

    fn context(host: ScriptedHost) -> WorkloadContext {
        let cleanup = CleanupRegistry::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        WorkloadContext {
            runner: ProcessRunner::new(Arc::new(host), clock.clone(), cleanup.clone()),
            state: StateStore::in_memory(),
            cleanup,
            clock,
        }
    }

    #[test]
    fn identity_display_includes_role() {
        let id = WorkloadIdentity::new("sysbench", Some(Role::Client), "sysbench");
        assert_eq!(id.to_string(), "sysbench (Client)");
        let id = WorkloadIdentity::new("speccpu", None, "speccpu2017");
        assert_eq!(id.to_string(), "speccpu");
    }

    #[tokio::test]
    async fn run_checked_rejects_non_zero_exit() {
        let ctx = context(ScriptedHost::new([Script::exit(2)]));
        let err = ctx
            .run_checked(&ProcessRequest::new("make"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkloadFailed { .. }));
    }

    #[tokio::test]
    async fn run_checked_treats_timeout_as_error() {
        let ctx = context(ScriptedHost::new([Script::Hang]));
        let req = ProcessRequest::new("mount").timeout(Duration::from_millis(20));
        let err = ctx.run_checked(&req, &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, Error::WorkloadTimeout { .. }));
    }

    #[tokio::test]
    async fn run_checked_returns_execution_on_success() {
        let ctx = context(ScriptedHost::new([Script::ok("3\n")]));
        let exec = ctx
            .run_checked(&ProcessRequest::new("mysql"), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(exec.stdout, "3\n");
    }
}
