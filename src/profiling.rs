//! Background monitors that run alongside the workload process.
//!
//! A [`ProfilingScope`] starts a monitor on a separate task and stops it when
//! the scope is dropped, so every exit path out of the run phase releases it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cancel::{CancelSource, CancelToken};
use crate::clock::Clock;

#[async_trait]
pub trait BackgroundMonitor: Send + Sync {
    fn name(&self) -> &str;

    /// Runs until `stop` is cancelled.
    async fn run(&self, stop: CancelToken);
}

/// Does nothing. Used when profiling is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

#[async_trait]
impl BackgroundMonitor for NoopMonitor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self, stop: CancelToken) {
        stop.cancelled().await;
    }
}

/// Logs how long the workload has been running at a fixed interval.
pub struct ProgressMonitor {
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ProgressMonitor {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { clock, interval }
    }
}

#[async_trait]
impl BackgroundMonitor for ProgressMonitor {
    fn name(&self) -> &str {
        "progress"
    }

    async fn run(&self, stop: CancelToken) {
        let started = self.clock.now();
        loop {
            tokio::select! {
                _ = self.clock.sleep(self.interval) => {
                    let elapsed = self.clock.now().saturating_duration_since(started);
                    info!(elapsed_secs = elapsed.as_secs(), "Workload still running");
                }
                _ = stop.cancelled() => return,
            }
        }
    }
}

/// Keeps a monitor running until dropped.
pub struct ProfilingScope {
    name: String,
    stop: CancelSource,
    handle: Option<JoinHandle<()>>,
}

impl ProfilingScope {
    pub fn start(monitor: Arc<dyn BackgroundMonitor>) -> Self {
        let stop = CancelSource::new();
        let token = stop.token();
        let name = monitor.name().to_string();
        debug!(monitor = %name, "Starting background monitor");
        let handle = tokio::spawn(async move { monitor.run(token).await });
        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ProfilingScope {
    fn drop(&mut self) {
        self.stop.cancel();
        // The task observes the stop signal and exits on its own.
        self.handle.take();
        debug!(monitor = %self.name, "Background monitor released");
    }
}
