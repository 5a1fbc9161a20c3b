//! Orchestration loop state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Transition history kept in memory.
const MAX_TRANSITIONS: usize = 100;

/// Where the loop is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    CheckingLimits,
    UsageLimited,
    Waiting,
    CheckingSession,
    Unhealthy,
    Recovering,
    ProcessingQueue,
    TaskRunning,
    TaskDone,
    TaskFailed,
    TaskUsageLimited,
    Stopped,
}

impl LoopState {
    pub fn can_transition_to(&self, target: LoopState) -> bool {
        use LoopState::*;

        if target == Stopped {
            return *self != Stopped;
        }
        matches!(
            (self, target),
            (Idle, CheckingLimits) |
            (CheckingLimits, UsageLimited) | (CheckingLimits, CheckingSession) |
            (UsageLimited, Waiting) |
            (Waiting, Idle) |
            (CheckingSession, Unhealthy) | (CheckingSession, ProcessingQueue) |
            (CheckingSession, Idle) |
            (Unhealthy, Recovering) |
            (Recovering, Idle) |
            (ProcessingQueue, TaskRunning) | (ProcessingQueue, Idle) |
            (TaskRunning, TaskDone) | (TaskRunning, TaskFailed) |
            (TaskRunning, TaskUsageLimited) |
            (TaskDone, Idle) |
            (TaskFailed, Idle) |
            (TaskUsageLimited, Waiting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::CheckingLimits => "checking_limits",
            Self::UsageLimited => "usage_limited",
            Self::Waiting => "waiting",
            Self::CheckingSession => "checking_session",
            Self::Unhealthy => "unhealthy",
            Self::Recovering => "recovering",
            Self::ProcessingQueue => "processing_queue",
            Self::TaskRunning => "task_running",
            Self::TaskDone => "task_done",
            Self::TaskFailed => "task_failed",
            Self::TaskUsageLimited => "task_usage_limited",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopTransition {
    pub from: LoopState,
    pub to: LoopState,
    pub at: DateTime<Utc>,
}

/// Current loop state plus a bounded history.
#[derive(Debug, Clone)]
pub struct LoopStateTracker {
    current: LoopState,
    transitions: Vec<LoopTransition>,
}

impl Default for LoopStateTracker {
    fn default() -> Self {
        Self {
            current: LoopState::Idle,
            transitions: Vec::new(),
        }
    }
}

impl LoopStateTracker {
    pub fn current(&self) -> LoopState {
        self.current
    }

    pub fn transitions(&self) -> &[LoopTransition] {
        &self.transitions
    }

    /// Move to `to`. Illegal moves are logged and applied anyway, the loop
    /// must keep running.
    pub fn advance(&mut self, to: LoopState, at: DateTime<Utc>) {
        let from = self.current;
        if from == to {
            return;
        }
        if from.can_transition_to(to) {
            debug!(%from, %to, "Loop state");
        } else {
            warn!(%from, %to, "Unexpected loop state transition");
        }

        self.transitions.push(LoopTransition { from, to, at });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain);
        }
        self.current = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_paths_are_legal() {
        use LoopState::*;
        let paths: &[&[LoopState]] = &[
            &[Idle, CheckingLimits, UsageLimited, Waiting, Idle],
            &[Idle, CheckingLimits, CheckingSession, Unhealthy, Recovering, Idle],
            &[
                Idle,
                CheckingLimits,
                CheckingSession,
                ProcessingQueue,
                TaskRunning,
                TaskUsageLimited,
                Waiting,
                Idle,
            ],
            &[Idle, CheckingLimits, CheckingSession, ProcessingQueue, TaskRunning, TaskDone, Idle],
        ];
        for path in paths {
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn stopped_is_terminal_and_reachable() {
        assert!(LoopState::Waiting.can_transition_to(LoopState::Stopped));
        assert!(LoopState::Stopped.is_terminal());
        assert!(!LoopState::Stopped.can_transition_to(LoopState::Idle));
        assert!(!LoopState::Idle.can_transition_to(LoopState::TaskRunning));
    }

    #[test]
    fn tracker_history_is_capped() {
        let mut tracker = LoopStateTracker::default();
        let now = Utc::now();
        for _ in 0..80 {
            tracker.advance(LoopState::CheckingLimits, now);
            tracker.advance(LoopState::CheckingSession, now);
            tracker.advance(LoopState::Idle, now);
        }
        assert_eq!(tracker.transitions().len(), MAX_TRANSITIONS);
        assert_eq!(tracker.current(), LoopState::Idle);
    }
}
