//! Job identity, lifecycle state machine, and progress tracking.
//!
//! # State machine
//!
//! ```text
//!            start()               succeed()
//!  Pending ──────────► Running ──────────────► Succeeded
//!     │                   │  fail()
//!     │                   ├──────────────────► Failed
//!     │ cancel()          │  cancel()
//!     └───────────────────┴──────────────────► Cancelled
//! ```
//!
//! Terminal states are absorbing.  Every other transition is rejected with a
//! [`TransitionError`], which lets the executor treat "the job already ended"
//! as a value instead of a race.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one job, unique within its owning session.
///
/// Serialized as a bare integer so clients can correlate `progress`, `result`,
/// `error`, and `cancelled` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Accepted; the executor task has not started work yet.
    Pending,
    /// Staging inputs, waiting for an inference slot, or inferring.
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// The event that drives a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Succeed,
    Fail,
    Cancel,
}

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {event:?} to a job in state {from:?}")]
pub struct TransitionError {
    pub from: JobState,
    pub event: JobEvent,
}

impl JobState {
    /// Returns `true` for `Succeeded`, `Failed`, and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Computes the state reached by applying `event`, without mutating.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when `event` is not legal from `self`.
    pub fn transition(self, event: JobEvent) -> Result<JobState, TransitionError> {
        use JobEvent::*;
        use JobState::*;

        match (self, event) {
            (Pending, Start) => Ok(Running),
            (Pending, Cancel) | (Running, Cancel) => Ok(Cancelled),
            (Running, Succeed) => Ok(Succeeded),
            (Running, Fail) => Ok(Failed),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    /// Applies `event` in place.
    pub fn apply(&mut self, event: JobEvent) -> Result<JobState, TransitionError> {
        let next = self.transition(event)?;
        *self = next;
        Ok(next)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Keeps reported progress non-decreasing and within `0..=100`.
///
/// The executor reports fixed phase percentages, but a tracker still guards
/// the invariant so a reordered call can never make a client's progress bar
/// move backwards.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    percent: u8,
    phase: String,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new phase.
    ///
    /// Values above 100 are clamped.  Returns the accepted percentage, or
    /// `None` when `percent` is lower than the last accepted value (the update
    /// is then ignored).
    pub fn advance(&mut self, percent: u8, phase: impl Into<String>) -> Option<u8> {
        let percent = percent.min(100);
        if percent < self.percent {
            return None;
        }
        self.percent = percent;
        self.phase = phase.into();
        Some(percent)
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_job_starts_running() {
        assert_eq!(JobState::Pending.transition(JobEvent::Start), Ok(JobState::Running));
    }

    #[test]
    fn test_pending_job_can_be_cancelled_before_start() {
        assert_eq!(
            JobState::Pending.transition(JobEvent::Cancel),
            Ok(JobState::Cancelled)
        );
    }

    #[test]
    fn test_running_job_reaches_each_terminal_state() {
        assert_eq!(JobState::Running.transition(JobEvent::Succeed), Ok(JobState::Succeeded));
        assert_eq!(JobState::Running.transition(JobEvent::Fail), Ok(JobState::Failed));
        assert_eq!(JobState::Running.transition(JobEvent::Cancel), Ok(JobState::Cancelled));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            assert!(terminal.is_terminal());
            for event in [JobEvent::Start, JobEvent::Succeed, JobEvent::Fail, JobEvent::Cancel] {
                assert!(
                    terminal.transition(event).is_err(),
                    "{terminal:?} must reject {event:?}"
                );
            }
        }
    }

    #[test]
    fn test_pending_job_cannot_succeed_without_running() {
        // Arrange
        let mut state = JobState::Pending;

        // Act
        let result = state.apply(JobEvent::Succeed);

        // Assert
        assert_eq!(
            result,
            Err(TransitionError {
                from: JobState::Pending,
                event: JobEvent::Succeed
            })
        );
        assert_eq!(state, JobState::Pending, "rejected transition must not mutate");
    }

    #[test]
    fn test_apply_mutates_on_success() {
        let mut state = JobState::Pending;
        state.apply(JobEvent::Start).unwrap();
        state.apply(JobEvent::Cancel).unwrap();
        assert_eq!(state, JobState::Cancelled);
    }

    #[test]
    fn test_progress_tracker_ignores_regressions() {
        // Arrange
        let mut tracker = ProgressTracker::new();
        tracker.advance(40, "Running lip-sync inference");

        // Act
        let regressed = tracker.advance(25, "Waiting for inference slot");

        // Assert
        assert_eq!(regressed, None);
        assert_eq!(tracker.percent(), 40);
        assert_eq!(tracker.phase(), "Running lip-sync inference");
    }

    #[test]
    fn test_progress_tracker_clamps_to_one_hundred() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.advance(250, "done"), Some(100));
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn test_progress_tracker_accepts_repeated_percentage() {
        let mut tracker = ProgressTracker::new();
        tracker.advance(15, "a");
        assert_eq!(tracker.advance(15, "b"), Some(15));
        assert_eq!(tracker.phase(), "b");
    }

    #[test]
    fn test_job_id_serializes_as_bare_integer() {
        assert_eq!(serde_json::to_string(&JobId(7)).unwrap(), "7");
    }
}
