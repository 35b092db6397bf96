//! Sequencer state, cancellation and run reports.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::drift::Vector3;
use crate::error::DaqError;
use crate::experiment::row::RowId;
use crate::sink::SinkResult;

/// Sequencer execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──> ForTimepoint ──> ForRow ──> SinglePos ────┐
///               ▲             ▲   ├──> SteppedZLoop ─┤
///               │             │   └──> SweepZ ───────┤
///               │             │                      ▼
///               │             └──────────────── FinalizeStack
///               │                                    │
///               └──────── NextTimepoint <────────────┘
///                             │
///                             ▼
///                     Completed | Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    /// No run in progress
    Idle,
    /// Waiting for or starting a time point
    ForTimepoint,
    /// Positioning for a row
    ForRow,
    /// Capturing a single-position stack
    SinglePos,
    /// Stepping through Z
    SteppedZLoop,
    /// Sweeping Z continuously
    SweepZ,
    /// Closing a stack
    FinalizeStack,
    /// Advancing to the next time point
    NextTimepoint,
    /// Run finished normally
    Completed,
    /// Run ended by cancellation or failure
    Aborted,
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SequencerState::Idle => "Idle",
            SequencerState::ForTimepoint => "ForTimepoint",
            SequencerState::ForRow => "ForRow",
            SequencerState::SinglePos => "SinglePos",
            SequencerState::SteppedZLoop => "SteppedZLoop",
            SequencerState::SweepZ => "SweepZ",
            SequencerState::FinalizeStack => "FinalizeStack",
            SequencerState::NextTimepoint => "NextTimepoint",
            SequencerState::Completed => "Completed",
            SequencerState::Aborted => "Aborted",
        };
        write!(f, "{}", name)
    }
}

impl SequencerState {
    /// Check if a new run may start.
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            SequencerState::Idle | SequencerState::Completed | SequencerState::Aborted
        )
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        !self.can_begin()
    }

    /// Whether `next` is a legal successor. Any running state may abort.
    pub fn can_transition_to(&self, next: SequencerState) -> bool {
        use SequencerState::*;
        if next == Aborted {
            return self.is_running();
        }
        matches!(
            (self, next),
            (Idle | Completed | Aborted, ForTimepoint)
                | (ForTimepoint, ForRow)
                | (ForRow, SinglePos | SteppedZLoop | SweepZ)
                | (SinglePos | SteppedZLoop | SweepZ, FinalizeStack)
                | (FinalizeStack, ForRow | NextTimepoint)
                | (NextTimepoint, ForTimepoint | Completed)
        )
    }
}

/// Shared view of the sequencer state for observers on other threads.
#[derive(Debug, Clone)]
pub struct StateHandle {
    inner: Arc<RwLock<SequencerState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SequencerState::Idle)),
        }
    }
}

impl StateHandle {
    /// Current state.
    pub fn get(&self) -> SequencerState {
        *self.inner.read()
    }

    /// Move to `next`, returning whether the transition was legal.
    ///
    /// Illegal transitions are still applied so observers see where the
    /// sequencer actually is.
    pub(crate) fn set(&self, next: SequencerState) -> bool {
        let mut state = self.inner.write();
        let legal = state.can_transition_to(next);
        *state = next;
        legal
    }
}

/// Cooperative cancellation flag checked at row and Z-step boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear a previous request before a new run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Terminal status of a run.
#[derive(Debug)]
pub enum RunStatus {
    /// Every planned stack was captured
    Completed,
    /// Stopped on request; the sink holds the partial result
    Cancelled,
    /// Stopped by a fault; the cause is preserved
    Failed(DaqError),
}

impl RunStatus {
    /// Completed or cancelled.
    pub fn is_success(&self) -> bool {
        !matches!(self, RunStatus::Failed(_))
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug)]
pub struct RunReport {
    /// Unique run identifier
    pub run_uid: Uuid,
    /// Terminal status
    pub status: RunStatus,
    /// Run start time
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration
    pub elapsed: Duration,
    /// Slices handed to the sink
    pub slices_captured: usize,
    /// Stacks run through `finalize_stack`
    pub stacks_completed: usize,
    /// Sink summary after finalization
    pub sink: SinkResult,
    /// Final drift offset per row
    pub drift_offsets: Vec<(RowId, Vector3)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use SequencerState::*;
        assert!(Idle.can_begin());
        assert!(Idle.can_transition_to(ForTimepoint));
        assert!(ForRow.can_transition_to(SteppedZLoop));
        assert!(FinalizeStack.can_transition_to(ForRow));
        assert!(NextTimepoint.can_transition_to(Completed));
        assert!(SweepZ.can_transition_to(Aborted));

        assert!(!Idle.can_transition_to(Aborted));
        assert!(!ForTimepoint.can_transition_to(SweepZ));
        assert!(!SteppedZLoop.can_transition_to(ForRow));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn status_display() {
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert!(RunStatus::Cancelled.is_success());
        assert!(!RunStatus::Failed(DaqError::PumpFailed("x".into())).is_success());
    }
}
