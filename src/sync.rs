//! Client/server readiness handshake.
//!
//! A client waits for each server peer in two phases: the agent answers its
//! heartbeat, then the server workload publishes its online signal. Each
//! phase is a [`RetryPolicy`] with fixed spacing, sized so the polls fit
//! inside the phase timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::ApiError;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::{Error, Result, SyncPhase};
use crate::layout::ClientInstance;
use crate::retry::{Backoff, RetryPolicy};

/// Default time between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Status queries against a peer agent.
#[async_trait]
pub trait RemoteStatus: Send + Sync {
    /// Whether the peer agent is reachable and answering.
    async fn heartbeat(&self, peer: &ClientInstance) -> std::result::Result<bool, ApiError>;

    /// Whether the peer's server workload has signalled it is online.
    async fn online(&self, peer: &ClientInstance) -> std::result::Result<bool, ApiError>;
}

/// Progress of the handshake with one peer. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncState {
    Unsynchronized,
    HeartbeatConfirmed,
    OnlineConfirmed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Unsynchronized => write!(f, "UNSYNCHRONIZED"),
            SyncState::HeartbeatConfirmed => write!(f, "HEARTBEAT_CONFIRMED"),
            SyncState::OnlineConfirmed => write!(f, "ONLINE_CONFIRMED"),
        }
    }
}

#[derive(Clone)]
pub struct RoleSynchronizer {
    status: Arc<dyn RemoteStatus>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl RoleSynchronizer {
    pub fn new(status: Arc<dyn RemoteStatus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            status,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Waits until `peer` answers heartbeats and then reports online.
    ///
    /// Returns `Ok(OnlineConfirmed)` on success. If `cancel` fires first the
    /// state reached so far is returned instead of an error.
    pub async fn wait_for_server_ready(
        &self,
        peer: &ClientInstance,
        heartbeat_timeout: Duration,
        online_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<SyncState> {
        let mut state = SyncState::Unsynchronized;

        if !self
            .poll_phase(peer, SyncPhase::Heartbeat, heartbeat_timeout, cancel)
            .await?
        {
            return Ok(state);
        }
        state = SyncState::HeartbeatConfirmed;
        info!(peer = %peer.endpoint(), state = %state, "Server heartbeat confirmed");

        if !self
            .poll_phase(peer, SyncPhase::Online, online_timeout, cancel)
            .await?
        {
            return Ok(state);
        }
        state = SyncState::OnlineConfirmed;
        info!(peer = %peer.endpoint(), state = %state, "Server online confirmed");

        Ok(state)
    }

    /// Retry policy for one phase: a poll right away, then one every
    /// `poll_interval` for as long as `timeout` allows.
    fn phase_policy(&self, timeout: Duration) -> RetryPolicy {
        let interval_ms = self.poll_interval.as_millis().max(1);
        let spaced = u32::try_from(timeout.as_millis() / interval_ms).unwrap_or(u32::MAX);
        RetryPolicy {
            max_attempts: spaced.saturating_add(1),
            backoff: Backoff::Fixed {
                delay_ms: u64::try_from(interval_ms).unwrap_or(u64::MAX),
            },
        }
    }

    /// Polls one phase. `Ok(false)` means the wait was cancelled.
    async fn poll_phase(
        &self,
        peer: &ClientInstance,
        phase: SyncPhase,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let endpoint = peer.endpoint();
        let result = self
            .phase_policy(timeout)
            .execute_when(
                self.clock.as_ref(),
                cancel,
                |polls| {
                    let endpoint = &endpoint;
                    async move {
                        let answer = match phase {
                            SyncPhase::Heartbeat => self.status.heartbeat(peer).await,
                            SyncPhase::Online => self.status.online(peer).await,
                        };
                        match answer {
                            Ok(true) => {
                                debug!(peer = %endpoint, %phase, polls, "Phase confirmed");
                                return Ok(());
                            }
                            Ok(false) => debug!(peer = %endpoint, %phase, polls, "Peer not ready yet"),
                            Err(e) => debug!(peer = %endpoint, %phase, polls, error = %e, "Status query failed"),
                        }
                        Err(Error::SynchronizationTimeout {
                            peer: endpoint.clone(),
                            phase,
                            timeout,
                        })
                    }
                },
                |e| matches!(e, Error::SynchronizationTimeout { .. }),
            )
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(_) if cancel.is_cancelled() => {
                debug!(peer = %endpoint, %phase, "Synchronization cancelled");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
