//! Bounded retry of fallible async operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Delay inserted between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    Fixed { delay_ms: u64 },
    /// `base_delay_ms * 2^(attempt - 1)`
    Exponential { base_delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::Config(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            backoff,
        })
    }

    /// Immediate retries, `max_attempts` clamped to at least one.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::None,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_delay_ms } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        }
    }

    /// Runs `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. Errors from every attempt but
    /// the last are swallowed; the last one propagates.
    pub async fn execute<T, E, F, Fut>(
        &self,
        clock: &dyn Clock,
        cancel: &CancelToken,
        op: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + Display,
    {
        self.execute_when(clock, cancel, op, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors matching `should_retry`
    /// are retried; any other error propagates immediately.
    pub async fn execute_when<T, E, F, Fut, P>(
        &self,
        clock: &dyn Clock,
        cancel: &CancelToken,
        mut op: F,
        should_retry: P,
    ) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error: Option<E> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(last_error.unwrap_or_else(|| Error::Cancelled.into()));
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    last_error = Some(e);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = clock.sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
