//! Drives a workload through its lifecycle.
//!
//! One [`WorkloadEngine::execute`] call is one run: resolve the package and
//! initialize, then run one flow per server peer (multi-role client) or a
//! single local flow, capture metrics, and finally drain the cleanup registry
//! exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{SERVER_ONLINE_KEY, ServerOnlineState};
use crate::cancel::CancelToken;
use crate::cleanup::CleanupRegistry;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, PeerFailure, Result};
use crate::layout::{ClientInstance, Layout, Role};
use crate::lifecycle::{FlowRecord, Lifecycle, PhaseOutcome, RunReport, RunStatus, State};
use crate::metrics::{ArchiveTarget, ArtifactSink, MetricsPipeline, TelemetrySink, TracingTelemetrySink};
use crate::packages::{PackagePath, PackageResolver, StaticPackageResolver};
use crate::process::{DEFAULT_START_ATTEMPTS, ExecutionStatus, ProcessHost, ProcessRunner, TokioProcessHost};
use crate::profiling::{BackgroundMonitor, NoopMonitor, ProfilingScope};
use crate::retry::RetryPolicy;
use crate::state::StateStore;
use crate::sync::{DEFAULT_POLL_INTERVAL, RemoteStatus, RoleSynchronizer, SyncState};
use crate::workload::{Workload, WorkloadContext};

/// How long a client waits for a server agent to answer heartbeats.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(40 * 60);

/// How long a client waits for the server workload's online signal.
pub const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct EngineBuilder {
    clock: Arc<dyn Clock>,
    host: Arc<dyn ProcessHost>,
    state: StateStore,
    packages: Arc<dyn PackageResolver>,
    status: Option<Arc<dyn RemoteStatus>>,
    telemetry: Arc<dyn TelemetrySink>,
    artifacts: Option<(Arc<dyn ArtifactSink>, ArchiveTarget)>,
    monitor: Arc<dyn BackgroundMonitor>,
    layout: Layout,
    start_policy: RetryPolicy,
    flow_policy: RetryPolicy,
    poll_interval: Duration,
    heartbeat_timeout: Duration,
    online_timeout: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            host: Arc::new(TokioProcessHost),
            state: StateStore::in_memory(),
            packages: Arc::new(StaticPackageResolver::new()),
            status: None,
            telemetry: Arc::new(TracingTelemetrySink),
            artifacts: None,
            monitor: Arc::new(NoopMonitor),
            layout: Layout::default(),
            start_policy: RetryPolicy::immediate(DEFAULT_START_ATTEMPTS),
            flow_policy: RetryPolicy::immediate(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            online_timeout: DEFAULT_ONLINE_TIMEOUT,
        }
    }
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn process_host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = host;
        self
    }

    pub fn state(mut self, state: StateStore) -> Self {
        self.state = state;
        self
    }

    pub fn packages(mut self, packages: Arc<dyn PackageResolver>) -> Self {
        self.packages = packages;
        self
    }

    /// Enables synchronization with server peers.
    pub fn remote_status(mut self, status: Arc<dyn RemoteStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn artifacts(mut self, sink: Arc<dyn ArtifactSink>, target: ArchiveTarget) -> Self {
        self.artifacts = Some((sink, target));
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn BackgroundMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn start_policy(mut self, policy: RetryPolicy) -> Self {
        self.start_policy = policy;
        self
    }

    /// Retry policy for whole flows. Only retryable errors are retried.
    pub fn flow_policy(mut self, policy: RetryPolicy) -> Self {
        self.flow_policy = policy;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn sync_timeouts(mut self, heartbeat: Duration, online: Duration) -> Self {
        self.heartbeat_timeout = heartbeat;
        self.online_timeout = online;
        self
    }

    pub fn build(self) -> WorkloadEngine {
        let synchronizer = self.status.map(|status| {
            RoleSynchronizer::new(status, self.clock.clone()).with_poll_interval(self.poll_interval)
        });
        let mut pipeline = MetricsPipeline::new(self.telemetry);
        if let Some((sink, target)) = self.artifacts {
            pipeline = pipeline.with_artifacts(sink, target);
        }

        WorkloadEngine {
            clock: self.clock,
            host: self.host,
            state: self.state,
            packages: self.packages,
            synchronizer,
            pipeline,
            monitor: self.monitor,
            layout: self.layout,
            start_policy: self.start_policy,
            flow_policy: self.flow_policy,
            heartbeat_timeout: self.heartbeat_timeout,
            online_timeout: self.online_timeout,
        }
    }
}

pub struct WorkloadEngine {
    clock: Arc<dyn Clock>,
    host: Arc<dyn ProcessHost>,
    state: StateStore,
    packages: Arc<dyn PackageResolver>,
    synchronizer: Option<RoleSynchronizer>,
    pipeline: MetricsPipeline,
    monitor: Arc<dyn BackgroundMonitor>,
    layout: Layout,
    start_policy: RetryPolicy,
    flow_policy: RetryPolicy,
    heartbeat_timeout: Duration,
    online_timeout: Duration,
}

/// One flow's lifecycle and the record being built for it.
struct FlowState {
    lifecycle: Lifecycle,
    record: FlowRecord,
}

impl FlowState {
    fn new(peer: Option<&ClientInstance>, lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            record: FlowRecord::new(peer.map(ClientInstance::endpoint)),
        }
    }

    /// Moves the lifecycle on from a phase error. Returns the error unless
    /// it was a cancellation.
    ///
    /// Only the measured command's own timeout is soft, and `run_flow`
    /// handles that one before it becomes an error. A timeout raised by
    /// setup commands lands here and fails the flow.
    fn absorb(&mut self, error: Error) -> Option<Error> {
        if matches!(error, Error::Cancelled) {
            self.lifecycle.advance(PhaseOutcome::Cancelled);
            return None;
        }
        self.record.record_error(&error);
        self.lifecycle.advance(PhaseOutcome::Failure(error.kind()));
        Some(error)
    }

    fn into_record(mut self) -> FlowRecord {
        self.record.transitions = self.lifecycle.transitions();
        self.record
    }
}

impl WorkloadEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Runs `workload` once. The report carries the run's error, if any;
    /// use [`RunReport::into_result`] to propagate it.
    pub async fn execute(&self, workload: &dyn Workload, cancel: &CancelToken) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = self.clock.utc_now();
        let identity = workload.identity().clone();
        let multi_role = identity.role == Some(Role::Client) && self.layout.is_multi_role();

        let cleanup = CleanupRegistry::new();
        let ctx = WorkloadContext {
            runner: ProcessRunner::new(self.host.clone(), self.clock.clone(), cleanup.clone())
                .with_start_policy(self.start_policy),
            state: self.state.clone(),
            cleanup: cleanup.clone(),
            clock: self.clock.clone(),
        };

        info!(run_id = %run_id, workload = %identity, multi_role, "Starting workload run");

        let mut lifecycle = Lifecycle::new(multi_role);
        lifecycle.advance(PhaseOutcome::Success);

        let (mut flows, error) = match self.initialize(workload, &ctx, cancel).await {
            Ok(package) => {
                self.run_flows(workload, &ctx, &package, &lifecycle, multi_role, cancel)
                    .await
            }
            Err(e) => {
                let mut flow = FlowState::new(None, lifecycle);
                let error = flow.absorb(e);
                (vec![flow], error)
            }
        };

        let cleanup_summary = cleanup.drain();
        for flow in &mut flows {
            if flow.lifecycle.state() == State::CleaningUp {
                flow.lifecycle.advance(PhaseOutcome::Success);
            }
        }

        let flows: Vec<FlowRecord> = flows.into_iter().map(FlowState::into_record).collect();
        let status = if error.is_some() {
            RunStatus::Failed
        } else if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if flows.iter().any(|f| !f.warnings.is_empty()) {
            RunStatus::Degraded
        } else {
            RunStatus::Completed
        };

        let completed_at = self.clock.utc_now();
        let report = RunReport {
            run_id,
            workload: identity.name.clone(),
            role: identity.role,
            status,
            flows,
            cleanup: cleanup_summary,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            error,
        };

        match &report.error {
            Some(e) => error!(
                run_id = %report.run_id,
                workload = %identity,
                kind = %e.kind(),
                error = %e,
                "Workload run failed"
            ),
            None => info!(
                run_id = %report.run_id,
                workload = %identity,
                status = ?report.status,
                metrics = report.metrics_emitted(),
                duration_ms = report.duration_ms,
                "Workload run finished"
            ),
        }
        report
    }

    async fn initialize(
        &self,
        workload: &dyn Workload,
        ctx: &WorkloadContext,
        cancel: &CancelToken,
    ) -> Result<PackagePath> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let identity = workload.identity();
        let package = self
            .packages
            .get_package(&identity.package)?
            .ok_or_else(|| Error::DependencyMissing {
                package: identity.package.clone(),
            })?;

        workload.initialize(ctx, &package, cancel).await?;
        info!(workload = %identity, package = %package.path.display(), "Workload initialized");
        Ok(package)
    }

    /// Runs every flow to completion and aggregates their errors.
    async fn run_flows(
        &self,
        workload: &dyn Workload,
        ctx: &WorkloadContext,
        package: &PackagePath,
        base: &Lifecycle,
        multi_role: bool,
        cancel: &CancelToken,
    ) -> (Vec<FlowState>, Option<Error>) {
        let peers: Vec<Option<&ClientInstance>> = if multi_role {
            self.layout.instances_with_role(Role::Server).map(Some).collect()
        } else {
            vec![None]
        };

        let results = join_all(
            peers
                .iter()
                .map(|peer| self.run_flow_with_retry(workload, ctx, package, *peer, base, cancel)),
        )
        .await;

        let total = results.len();
        let mut flows = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (flow, result) in results {
            if let Err(error) = result {
                failures.push(PeerFailure {
                    peer: flow.record.peer.clone().unwrap_or_else(|| "local".to_string()),
                    error,
                });
            }
            flows.push(flow);
        }

        let error = if failures.is_empty() {
            None
        } else if multi_role {
            Some(Error::PeerFlows { total, failures })
        } else {
            failures.pop().map(|f| f.error)
        };
        (flows, error)
    }

    async fn run_flow_with_retry(
        &self,
        workload: &dyn Workload,
        ctx: &WorkloadContext,
        package: &PackagePath,
        peer: Option<&ClientInstance>,
        base: &Lifecycle,
        cancel: &CancelToken,
    ) -> (FlowState, Result<()>) {
        let latest = Mutex::new(FlowState::new(peer, base.clone()));
        let policy = workload
            .flow_attempts()
            .map_or(self.flow_policy, RetryPolicy::immediate);
        let max_attempts = policy.max_attempts;

        let result = policy
            .execute_when(
                self.clock.as_ref(),
                cancel,
                |attempt| {
                    let latest = &latest;
                    async move {
                        let mut flow = FlowState::new(peer, base.clone());
                        flow.record.attempts = attempt;
                        let result = match self.run_flow(workload, ctx, package, peer, &mut flow, cancel).await {
                            Ok(()) => Ok(()),
                            Err(e) => flow.absorb(e).map_or(Ok(()), Err),
                        };
                        if let Err(e) = &result
                            && attempt < max_attempts
                            && e.is_retryable()
                        {
                            warn!(
                                peer = ?flow.record.peer,
                                attempt,
                                max_attempts,
                                error = %e,
                                "Flow failed, retrying"
                            );
                        }
                        *latest.lock().unwrap_or_else(|e| e.into_inner()) = flow;
                        result
                    }
                },
                Error::is_retryable,
            )
            .await;

        let mut flow = latest.into_inner().unwrap_or_else(|e| e.into_inner());
        let result = match result {
            // Cancelled before any attempt ran.
            Err(Error::Cancelled) => {
                flow.lifecycle.advance(PhaseOutcome::Cancelled);
                Ok(())
            }
            other => other,
        };
        (flow, result)
    }

    /// One attempt of a flow, from synchronization through metrics capture.
    async fn run_flow(
        &self,
        workload: &dyn Workload,
        ctx: &WorkloadContext,
        package: &PackagePath,
        peer: Option<&ClientInstance>,
        flow: &mut FlowState,
        cancel: &CancelToken,
    ) -> Result<()> {
        if let Some(peer) = peer {
            flow.lifecycle.advance(PhaseOutcome::Success);
            let synchronizer = self.synchronizer.as_ref().ok_or_else(|| {
                Error::Config(
                    "multi-role client runs need an agent API client for synchronization".to_string(),
                )
            })?;
            info!(peer = %peer, "Synchronization: waiting for server");
            let state = synchronizer
                .wait_for_server_ready(peer, self.heartbeat_timeout, self.online_timeout, cancel)
                .await?;
            if state != SyncState::OnlineConfirmed {
                return Err(Error::Cancelled);
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        flow.lifecycle.advance(PhaseOutcome::Success);

        let execution = {
            let _profiling = ProfilingScope::start(self.monitor.clone());
            workload.prepare(ctx, package, peer, cancel).await?;
            if workload.identity().role == Some(Role::Server) {
                publish_online(ctx)?;
            }
            let request = workload.command(package, peer)?;
            ctx.runner.run(&request, cancel).await?
        };

        match execution.status {
            ExecutionStatus::Cancelled => return Err(Error::Cancelled),
            ExecutionStatus::TimedOut => {
                if let Some(timeout) = execution.timeout_error() {
                    flow.record.warnings.push(timeout.to_string());
                }
                flow.lifecycle.advance(PhaseOutcome::Degraded);
                return Ok(());
            }
            ExecutionStatus::Completed => execution.ensure_success()?,
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        flow.lifecycle.advance(PhaseOutcome::Success);

        let results = workload.collect_results(&execution, package).await?;
        let parser = workload.metrics_parser();
        let metrics = self
            .pipeline
            .capture(&execution, &results, parser.as_ref(), &workload.metrics_context(peer))
            .await?;
        flow.record.metrics_emitted = metrics.len();
        workload.results_captured(package).await?;

        let files = workload.artifacts(package)?;
        if !files.is_empty() {
            let uploaded = self.pipeline.archive(&files, workload.artifact_folder()).await;
            info!(uploaded, total = files.len(), "Artifacts archived");
        }

        flow.lifecycle.advance(PhaseOutcome::Success);
        Ok(())
    }
}

/// Saves the online signal peers poll for, and clears it at cleanup.
fn publish_online(ctx: &WorkloadContext) -> Result<()> {
    ctx.state.save(SERVER_ONLINE_KEY, &ServerOnlineState::online())?;
    let state = ctx.state.clone();
    ctx.cleanup.register("reset server online signal", move || {
        state
            .save(SERVER_ONLINE_KEY, &ServerOnlineState::default())
            .map_err(|e| e.to_string())
    });
    info!("Server online signal published");
    Ok(())
}
