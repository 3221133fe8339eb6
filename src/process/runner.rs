use std::future::pending;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ExecutionStatus, ProcessExecution, ProcessExit, ProcessHost, ProcessRequest, RunningProcess};
use crate::cancel::CancelToken;
use crate::cleanup::CleanupRegistry;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default number of spawn attempts before giving up with `StartupError`.
pub const DEFAULT_START_ATTEMPTS: u32 = 3;

/// Runs external processes with timeout, cancellation and spawn retries.
#[derive(Clone)]
pub struct ProcessRunner {
    host: Arc<dyn ProcessHost>,
    clock: Arc<dyn Clock>,
    cleanup: CleanupRegistry,
    start_policy: RetryPolicy,
}

enum Ending {
    Exited(std::io::Result<ProcessExit>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(host: Arc<dyn ProcessHost>, clock: Arc<dyn Clock>, cleanup: CleanupRegistry) -> Self {
        Self {
            host,
            clock,
            cleanup,
            start_policy: RetryPolicy::immediate(DEFAULT_START_ATTEMPTS),
        }
    }

    pub fn with_start_policy(mut self, policy: RetryPolicy) -> Self {
        self.start_policy = policy;
        self
    }

    pub fn cleanup(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    /// Launches `request` and waits for it to exit, time out, or be cancelled.
    ///
    /// A timeout is not an error: the process is killed and the execution is
    /// returned with [`ExecutionStatus::TimedOut`]. Cancellation likewise yields
    /// [`ExecutionStatus::Cancelled`]. A non-zero exit code is reported as-is;
    /// use [`ProcessExecution::ensure_success`] to classify it.
    pub async fn run(&self, request: &ProcessRequest, cancel: &CancelToken) -> Result<ProcessExecution> {
        let mut process = self.start(request, cancel).await?;
        let pid = process.pid();
        let killer = process.killer();

        {
            let killer = killer.clone();
            self.cleanup.register(
                format!("kill '{}' (pid {pid:?})", request.command),
                move || {
                    killer.kill();
                    Ok(())
                },
            );
        }

        let started_at = self.clock.utc_now();
        debug!(
            command = %request.command,
            arguments = %request.arguments,
            pid = ?pid,
            "Process started"
        );

        let deadline = async {
            match request.timeout {
                Some(timeout) => self.clock.sleep(timeout).await,
                None => pending::<()>().await,
            }
        };

        let ending = tokio::select! {
            exit = process.wait() => Ending::Exited(exit),
            _ = deadline => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        let (status, exit) = match ending {
            Ending::Exited(Ok(exit)) => (ExecutionStatus::Completed, exit),
            Ending::Exited(Err(e)) => {
                killer.kill();
                warn!(command = %request.command, error = %e, "Process wait failed");
                return Err(Error::Io(e));
            }
            Ending::TimedOut => {
                warn!(
                    command = %request.command,
                    arguments = %request.arguments,
                    timeout = ?request.timeout,
                    "WorkloadTimeout: process exceeded its timeout and was killed"
                );
                killer.kill();
                (ExecutionStatus::TimedOut, reap(process.as_mut()).await)
            }
            Ending::Cancelled => {
                info!(command = %request.command, "Cancellation requested, killing process");
                killer.kill();
                (ExecutionStatus::Cancelled, reap(process.as_mut()).await)
            }
        };

        let ended_at = self.clock.utc_now();
        debug!(
            command = %request.command,
            exit_code = ?exit.code,
            status = ?status,
            "Process finished"
        );

        Ok(ProcessExecution {
            request: request.clone(),
            pid,
            started_at,
            ended_at,
            exit_code: exit.code,
            stdout: exit.stdout,
            stderr: exit.stderr,
            status,
        })
    }

    async fn start(&self, request: &ProcessRequest, cancel: &CancelToken) -> Result<Box<dyn RunningProcess>> {
        self.start_policy
            .execute(self.clock.as_ref(), cancel, |attempt| {
                let spawned = self.host.spawn(request).map_err(|source| {
                    warn!(
                        command = %request.command,
                        attempt,
                        error = %source,
                        "WorkloadStartupError: failed to start process"
                    );
                    Error::StartupError {
                        command: request.command.clone(),
                        attempts: attempt,
                        source,
                    }
                });
                std::future::ready(spawned)
            })
            .await
    }
}

/// Collects whatever the killed process left behind. Errors here race with
/// natural exit and are not failures.
async fn reap(process: &mut dyn RunningProcess) -> ProcessExit {
    match process.wait().await {
        Ok(exit) => exit,
        Err(e) => {
            debug!(error = %e, "Failed to reap killed process");
            ProcessExit::default()
        }
    }
}
