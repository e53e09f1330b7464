//! Per-scan lifecycle state machine.
//!
//! ```text
//! Created -> Prepared -> Staged -> BaselineRead -> Running -> Finalizing -> Unstaged -> CleanedUp
//!               |          |           |                        ^              |
//!               +----------+-----------+------ (unwind) --------+              +--> Aborted / Failed
//!
//! Aborted / Failed: reachable from every non-terminal state
//! ```
//!
//! An unwinding scan still passes through `Finalizing` and `Unstaged`, so
//! hardware is always unstaged exactly once, and then ends in `Aborted` or
//! `Failed` instead of `CleanedUp`. The three terminal states have no exits.

use beamline_core::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle state of a single scan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Built from a request, nothing computed yet
    Created,
    /// Positions computed and checked
    Prepared,
    /// Participating devices staged
    Staged,
    /// Baseline devices read
    BaselineRead,
    /// Acquiring points
    Running,
    /// Returning motors, completing flyers
    Finalizing,
    /// Devices unstaged
    Unstaged,
    /// Completed and unstaged
    CleanedUp,
    /// Stopped on request
    Aborted,
    /// Stopped by an error
    Failed,
}

impl ScanState {
    /// Whether the machine stops here.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::CleanedUp | ScanState::Aborted | ScanState::Failed
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ScanState) -> bool {
        use ScanState::*;
        match (self, next) {
            (Created, Prepared)
            | (Prepared, Staged)
            | (Staged, BaselineRead)
            | (BaselineRead, Running)
            | (Running, Finalizing)
            | (Finalizing, Unstaged)
            | (Unstaged, CleanedUp) => true,
            (Prepared | Staged | BaselineRead, Finalizing) => true,
            (from, _) if from.is_terminal() => false,
            (_, Aborted | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanState::Created => "created",
            ScanState::Prepared => "prepared",
            ScanState::Staged => "staged",
            ScanState::BaselineRead => "baseline_read",
            ScanState::Running => "running",
            ScanState::Finalizing => "finalizing",
            ScanState::Unstaged => "unstaged",
            ScanState::CleanedUp => "cleaned_up",
            ScanState::Aborted => "aborted",
            ScanState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Tracks the state of one scan and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct ScanStateMachine {
    state: ScanState,
    history: Vec<ScanState>,
}

impl Default for ScanStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanStateMachine {
    /// Machine in `Created`.
    pub fn new() -> Self {
        Self {
            state: ScanState::Created,
            history: vec![ScanState::Created],
        }
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[ScanState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// `EngineFault` if the transition is illegal.
    pub fn advance(&mut self, next: ScanState) -> ScanResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ScanError::EngineFault(format!(
                "illegal scan transition {} -> {next}",
                self.state
            )));
        }
        debug!(from = %self.state, to = %next, "scan state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ScanState::*;

    #[test]
    fn happy_path_is_linear() {
        let mut machine = ScanStateMachine::new();
        for next in [
            Prepared,
            Staged,
            BaselineRead,
            Running,
            Finalizing,
            Unstaged,
            CleanedUp,
        ] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.state(), CleanedUp);
        assert_eq!(machine.history().len(), 8);
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut machine = ScanStateMachine::new();
        assert!(matches!(
            machine.advance(Running),
            Err(ScanError::EngineFault(_))
        ));
        assert_eq!(machine.state(), Created);
    }

    #[test]
    fn unwinding_reaches_finalizing_from_early_states() {
        for start in [Prepared, Staged, BaselineRead, Running] {
            assert!(start.can_transition_to(Finalizing), "{start}");
        }
        assert!(!Created.can_transition_to(Finalizing));
        assert!(!Unstaged.can_transition_to(Finalizing));
    }

    #[test]
    fn terminal_outcomes_are_final() {
        assert!(Created.can_transition_to(Failed));
        assert!(Unstaged.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Aborted));
        assert!(!Failed.can_transition_to(Finalizing));
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        let all = [
            Created,
            Prepared,
            Staged,
            BaselineRead,
            Running,
            Finalizing,
            Unstaged,
            CleanedUp,
            Aborted,
            Failed,
        ];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn unwound_scan_ends_without_cleaning_up() {
        let mut machine = ScanStateMachine::new();
        for next in [Prepared, Staged, Finalizing, Unstaged, Failed] {
            machine.advance(next).unwrap();
        }
        assert!(machine.state().is_terminal());
        assert!(!machine.history().contains(&CleanedUp));
        assert!(machine.advance(CleanedUp).is_err());
    }
}
