use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Phases of a workload run.
///
/// A run flows through: NOT_STARTED → INITIALIZING → (SYNCHRONIZING) →
/// RUNNING → CAPTURING_METRICS → CLEANING_UP → COMPLETED, with FAILED
/// reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    NotStarted,
    Initializing,
    Synchronizing,
    Running,
    CapturingMetrics,
    CleaningUp,
    Completed,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::NotStarted => write!(f, "NOT_STARTED"),
            State::Initializing => write!(f, "INITIALIZING"),
            State::Synchronizing => write!(f, "SYNCHRONIZING"),
            State::Running => write!(f, "RUNNING"),
            State::CapturingMetrics => write!(f, "CAPTURING_METRICS"),
            State::CleaningUp => write!(f, "CLEANING_UP"),
            State::Completed => write!(f, "COMPLETED"),
            State::Failed => write!(f, "FAILED"),
        }
    }
}

/// How the work of the current phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseOutcome {
    Success,
    /// Finished with a soft failure, such as a process timeout.
    Degraded,
    Cancelled,
    Failure(ErrorKind),
}

/// Pure transition function for the run lifecycle. [`super::Lifecycle`]
/// applies it and keeps the history.
pub struct StateMachine;

impl StateMachine {
    /// Computes the phase that follows `state` given how it ended.
    ///
    /// - Any failure before `CleaningUp` completes is terminal (`Failed`).
    /// - Cancellation skips straight to `CleaningUp` so teardown still runs.
    /// - A degraded run skips metrics capture.
    /// - `Synchronizing` is only entered by multi-role runs.
    /// - Terminal states never change.
    pub fn next(state: State, outcome: PhaseOutcome, multi_role: bool) -> State {
        if state.is_terminal() {
            return state;
        }

        match outcome {
            PhaseOutcome::Failure(_) => State::Failed,
            PhaseOutcome::Cancelled => match state {
                State::CleaningUp => State::Completed,
                _ => State::CleaningUp,
            },
            PhaseOutcome::Degraded if state == State::Running => State::CleaningUp,
            PhaseOutcome::Success | PhaseOutcome::Degraded => match state {
                State::NotStarted => State::Initializing,
                State::Initializing if multi_role => State::Synchronizing,
                State::Initializing => State::Running,
                State::Synchronizing => State::Running,
                State::Running => State::CapturingMetrics,
                State::CapturingMetrics => State::CleaningUp,
                State::CleaningUp => State::Completed,
                State::Completed | State::Failed => state,
            },
        }
    }
}
