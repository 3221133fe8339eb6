mod record;
mod state;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use record::{FlowRecord, RunReport, RunStatus};
pub use state::{PhaseOutcome, State, StateMachine};

/// The current phase of one run or peer flow, plus every phase it has left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lifecycle {
    state: State,
    history: Vec<State>,
    multi_role: bool,
}

impl Lifecycle {
    pub fn new(multi_role: bool) -> Self {
        Self {
            state: State::NotStarted,
            history: Vec::new(),
            multi_role,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies `outcome` to the current phase and returns the new one.
    pub fn advance(&mut self, outcome: PhaseOutcome) -> State {
        let next = StateMachine::next(self.state, outcome, self.multi_role);
        if next != self.state {
            debug!(from = %self.state, to = %next, ?outcome, "Lifecycle transition");
            self.history.push(self.state);
            self.state = next;
        }
        next
    }

    /// Every phase visited, ending with the current one.
    pub fn transitions(&self) -> Vec<State> {
        let mut states = self.history.clone();
        states.push(self.state);
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn history_is_recorded() {
        let mut lifecycle = Lifecycle::new(false);
        lifecycle.advance(PhaseOutcome::Success);
        lifecycle.advance(PhaseOutcome::Success);
        lifecycle.advance(PhaseOutcome::Degraded);

        assert_eq!(lifecycle.state(), State::CleaningUp);
        assert_eq!(
            lifecycle.transitions(),
            vec![
                State::NotStarted,
                State::Initializing,
                State::Running,
                State::CleaningUp
            ]
        );
    }

    #[test]
    fn terminal_advance_does_not_grow_history() {
        let mut lifecycle = Lifecycle::new(true);
        lifecycle.advance(PhaseOutcome::Success);
        lifecycle.advance(PhaseOutcome::Failure(ErrorKind::DependencyMissing));
        assert!(lifecycle.is_terminal());

        lifecycle.advance(PhaseOutcome::Success);
        assert_eq!(
            lifecycle.transitions(),
            vec![State::NotStarted, State::Initializing, State::Failed]
        );
    }

    #[test]
    fn forked_lifecycle_keeps_shared_prefix() {
        let mut run = Lifecycle::new(true);
        run.advance(PhaseOutcome::Success);

        let mut flow = run.clone();
        flow.advance(PhaseOutcome::Success);
        assert_eq!(flow.state(), State::Synchronizing);
        assert_eq!(run.state(), State::Initializing);
    }
}
